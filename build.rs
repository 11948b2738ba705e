use std::fs;
use std::path::Path;

const PASSTHROUGH_ENV: &[&str] = &[
    "OTA_BASE_URL",
    "MQTT_HOST",
    "MQTT_PORT",
    "MQTT_USER",
    "MQTT_PASS",
    "MQTT_CLIENT_ID",
    "MQTT_PREFIX",
];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds (tests, simulator) skip it
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    for name in PASSTHROUGH_ENV {
        println!("cargo:rerun-if-env-changed={}", name);
    }
    println!("cargo:rerun-if-env-changed=OTA_BUILD");
    println!("cargo:rerun-if-env-changed=WIFI_SSID");
    println!("cargo:rerun-if-env-changed=WIFI_PASS");

    // Build number: explicit env wins, then the tracked counter file
    let build_file = Path::new("scripts").join("build-number.txt");
    println!("cargo:rerun-if-changed={}", build_file.display());

    let mut build = std::env::var("OTA_BUILD")
        .ok()
        .filter(|v| !v.trim().is_empty());
    if build.is_none() {
        if let Ok(contents) = fs::read_to_string(&build_file) {
            let candidate = contents.trim().to_string();
            if !candidate.is_empty() {
                build = Some(candidate);
            }
        }
    }
    if let Some(value) = build {
        println!("cargo:rustc-env=OTA_BUILD={}", value);
    }

    // WiFi credentials: environment first, then wifi_config.h
    println!("cargo:rerun-if-changed=wifi_config.h");
    let mut ssid = std::env::var("WIFI_SSID").ok();
    let mut password = std::env::var("WIFI_PASS").ok();

    let wifi_config_path = "wifi_config.h";
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;

        if ssid.is_none() {
            ssid = define_value(&contents, "WIFI_SSID");
        }
        if password.is_none() {
            password = define_value(&contents, "WIFI_PASSWORD");
        }
    }

    match ssid {
        Some(ssid) => println!("cargo:rustc-env=WIFI_SSID={}", ssid),
        None => println!(
            "cargo:warning=WiFi SSID not set! Export WIFI_SSID or copy wifi_config.h.example to wifi_config.h"
        ),
    }
    if let Some(password) = password {
        println!("cargo:rustc-env=WIFI_PASS={}", password);
    }

    Ok(())
}

fn define_value(contents: &str, name: &str) -> Option<String> {
    let needle = format!("#define {}", name);
    contents
        .lines()
        .find(|l| l.contains(&needle))
        .and_then(|line| line.split('"').nth(1))
        .map(str::to_string)
}
