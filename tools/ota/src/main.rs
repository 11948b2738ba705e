use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use c6_co2_node::network::join_url;
use c6_co2_node::ota::{Manifest, IMAGE_MAGIC, MANIFEST_FILE};
use c6_co2_node::version::{FilenamePattern, VersionNumber, DEFAULT_FILE_EXT, DEFAULT_FILE_PREFIX};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};

const COPY_CHUNK: usize = 16 * 1024;

#[derive(Parser)]
#[command(name = "ota")]
#[command(about = "C6 CO2 node OTA directory tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Advance the build counter; run before building the next release
    Bump {
        /// Build counter file
        #[arg(long, default_value = "scripts/build-number.txt")]
        counter: PathBuf,
    },
    /// Copy a firmware image into the OTA directory and advertise it
    Publish {
        /// Application image (output of `espflash save-image`)
        firmware: PathBuf,

        /// Directory served as the OTA base URL
        #[arg(short, long)]
        dir: PathBuf,

        /// Build number the image was compiled with (default: the counter file)
        #[arg(short, long)]
        build: Option<u32>,

        /// Build counter file
        #[arg(long, default_value = "scripts/build-number.txt")]
        counter: PathBuf,

        #[arg(long, default_value = DEFAULT_FILE_PREFIX)]
        prefix: String,
    },
    /// Show what an OTA server advertises
    Check {
        /// Base URL, e.g. http://192.168.1.18:8000/firmware
        base_url: String,

        /// Download the image and verify its digest
        #[arg(long)]
        verify: bool,

        #[arg(long, default_value = DEFAULT_FILE_PREFIX)]
        prefix: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Bump { counter } => bump(&counter),
        Commands::Publish {
            firmware,
            dir,
            build,
            counter,
            prefix,
        } => publish(&firmware, &dir, build, &counter, &prefix),
        Commands::Check {
            base_url,
            verify,
            prefix,
        } => check(&base_url, verify, &prefix),
    };
    if let Err(e) = result {
        eprintln!("{} {:#}", "❌".red(), e);
        std::process::exit(1);
    }
}

// Same reading as build.rs, which compiles this value in as OTA_BUILD
fn read_counter(counter: &Path) -> Result<VersionNumber> {
    let text = fs::read_to_string(counter).with_context(|| format!("cannot read {}", counter.display()))?;
    let build = text
        .trim()
        .parse::<u32>()
        .with_context(|| format!("{} does not hold a build number", counter.display()))?;
    Ok(VersionNumber(build))
}

fn published_build(counter: &Path, explicit: Option<u32>) -> Result<VersionNumber> {
    match explicit {
        Some(build) => Ok(VersionNumber(build)),
        None => read_counter(counter),
    }
}

fn bump(counter: &Path) -> Result<()> {
    let current = if counter.exists() {
        read_counter(counter)?
    } else {
        VersionNumber(0)
    };
    let next = VersionNumber(current.0 + 1);
    fs::write(counter, format!("{}\n", next))?;
    println!("{} Build counter {} -> {}", "🔢".blue(), current, next);
    println!("{}Rebuild the firmware before publishing", "   ".dimmed());
    Ok(())
}

fn manifest_line(filename: &str, digest: &[u8]) -> String {
    format!("{} {}\n", filename, hex::encode(digest))
}

fn publish(firmware: &Path, dir: &Path, build: Option<u32>, counter: &Path, prefix: &str) -> Result<()> {
    let mut source = File::open(firmware).with_context(|| format!("firmware not found: {}", firmware.display()))?;
    let size = source.metadata()?.len();
    if size == 0 {
        bail!("{} is empty", firmware.display());
    }

    let version = published_build(counter, build)?;
    let pattern = FilenamePattern::new(prefix, DEFAULT_FILE_EXT);
    let filename = pattern.filename(version);
    fs::create_dir_all(dir)?;
    let target = dir.join(&filename);

    println!("{} Publishing build {}", "🚀".blue(), version);
    println!("{}Image: {} bytes ({:.2} MB)", "   ".dimmed(), size, size as f64 / 1024.0 / 1024.0);

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")?
            .progress_chars("#>-"),
    );

    let mut out = File::create(&target)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut first = None;
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        first.get_or_insert(buf[0]);
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        pb.inc(n as u64);
    }
    pb.finish_and_clear();
    if first != Some(IMAGE_MAGIC) {
        println!(
            "{} {} does not start with 0x{:02X}; the device will reject it",
            "⚠️".yellow(),
            firmware.display(),
            IMAGE_MAGIC
        );
    }

    let digest = hasher.finalize();
    fs::write(dir.join(MANIFEST_FILE), manifest_line(&filename, &digest))?;

    println!("{} {} -> {}", "✅".green(), filename, dir.display());
    println!("{}sha256 {}", "   ".dimmed(), hex::encode(digest));
    Ok(())
}

fn check(base_url: &str, verify: bool, prefix: &str) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    let manifest_url = join_url(base_url, MANIFEST_FILE);
    let response = client.get(&manifest_url).send()?;
    if !response.status().is_success() {
        bail!("{} returned HTTP {}", manifest_url, response.status());
    }
    let text = response.text()?;
    let manifest = Manifest::parse(&text, &FilenamePattern::new(prefix, DEFAULT_FILE_EXT))
        .with_context(|| format!("malformed manifest {:?}", text.trim()))?;

    println!("{} Advertised build {} ({})", "📦".blue(), manifest.version, manifest.filename);
    match manifest.sha256 {
        Some(d) => println!("{}sha256 {}", "   ".dimmed(), hex::encode(d)),
        None => println!("{}no digest advertised", "   ".dimmed()),
    }

    let image_url = join_url(base_url, &manifest.filename);
    if !verify {
        let head = client.head(&image_url).send()?;
        if !head.status().is_success() {
            bail!("{} returned HTTP {}", image_url, head.status());
        }
        match head.content_length() {
            Some(len) => println!("{} Image reachable, {} bytes", "✅".green(), len),
            None => println!("{} Image reachable, length not declared", "✅".green()),
        }
        return Ok(());
    }

    let image = client.get(&image_url).send()?;
    if !image.status().is_success() {
        bail!("{} returned HTTP {}", image_url, image.status());
    }
    let bytes = image.bytes()?;
    let actual = Sha256::digest(&bytes);
    println!("{}downloaded {} bytes", "   ".dimmed(), bytes.len());
    match manifest.sha256 {
        Some(expected) if expected[..] != actual[..] => {
            bail!("digest mismatch: got {}", hex::encode(actual))
        }
        Some(_) => println!("{} Digest verified", "✅".green()),
        None => println!("{} sha256 {}", "ℹ️".blue(), hex::encode(actual)),
    }
    Ok(())
}
