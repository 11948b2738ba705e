use std::time::{Duration, Instant};

use c6_co2_node::error::NetworkError;
use c6_co2_node::network::join_url;
use c6_co2_node::ota::{OtaStatus, PartitionId, PartitionStorage, MANIFEST_FILE};
use c6_co2_node::sim::Reply;

use crate::rig::{app_image, image_url, serve_release, Rig, RigOptions, BASE_URL};

const OTA_PERIOD: Duration = Duration::from_secs(900);

#[test]
fn newer_release_is_staged_activated_and_booted() {
    let mut rig = Rig::new(RigOptions::default());
    let image = app_image(20_000);
    serve_release(&rig.http, 12, &image, Reply::ok(image.clone()));

    rig.tick(Instant::now());

    let flash = rig.flash();
    assert_eq!(flash.contents(PartitionId::SlotB), &image[..]);
    assert_eq!(flash.writes_to(PartitionId::SlotA), 0);
    assert_eq!(flash.boot_target(), PartitionId::SlotB);
    assert_eq!(flash.restarts(), 1);
    assert_eq!(flash.running(), PartitionId::SlotB);
    assert_eq!(rig.http.request_count(&image_url(12)), 1);
}

#[test]
fn second_update_goes_back_to_the_first_slot() {
    let mut rig = Rig::new(RigOptions {
        running: PartitionId::SlotB,
        ..Default::default()
    });
    let image = app_image(3_000);
    serve_release(&rig.http, 8, &image, Reply::ok(image.clone()));

    rig.tick(Instant::now());
    assert_eq!(rig.flash().boot_target(), PartitionId::SlotA);
    assert!(rig.flash().is_erased(PartitionId::Factory));
}

#[test]
fn same_or_older_release_is_not_downloaded() {
    for advertised in [7, 3] {
        let mut rig = Rig::new(RigOptions::default());
        let image = app_image(1_000);
        serve_release(&rig.http, advertised, &image, Reply::ok(image.clone()));

        rig.tick(Instant::now());

        assert_eq!(rig.http.request_count(&image_url(advertised)), 0);
        assert_eq!(rig.flash().boot_changes(), 0);
        assert_eq!(rig.state.snapshot().ota, OtaStatus::Idle);
    }
}

#[test]
fn corrupted_release_is_discarded_and_retried_next_cycle() {
    let mut rig = Rig::new(RigOptions::default());
    let image = app_image(10_000);
    let mut corrupted = image.clone();
    corrupted[5_000] ^= 0x01;
    serve_release(&rig.http, 12, &image, Reply::ok(corrupted));

    let t0 = Instant::now();
    rig.tick(t0);
    assert_eq!(rig.flash().boot_target(), PartitionId::SlotA);
    assert!(rig.flash().is_erased(PartitionId::SlotB));
    assert_eq!(rig.flash().restarts(), 0);
    assert_eq!(rig.state.snapshot().ota, OtaStatus::Failed);

    // Fixed on the server; nothing happens before the next check is due
    serve_release(&rig.http, 12, &image, Reply::ok(image.clone()));
    rig.tick(t0 + Duration::from_secs(60));
    assert_eq!(rig.http.request_count(&image_url(12)), 1);

    rig.tick(t0 + OTA_PERIOD);
    assert_eq!(rig.flash().boot_target(), PartitionId::SlotB);
    assert_eq!(rig.flash().contents(PartitionId::SlotB), &image[..]);
}

#[test]
fn truncated_download_never_moves_the_boot_pointer() {
    let mut rig = Rig::new(RigOptions::default());
    let image = app_image(8_192);
    serve_release(
        &rig.http,
        12,
        &image,
        Reply::Truncated {
            declared: image.len() as u64,
            body: image[..4_096].to_vec(),
        },
    );

    rig.tick(Instant::now());

    assert_eq!(rig.flash().boot_target(), PartitionId::SlotA);
    assert_eq!(rig.flash().boot_changes(), 0);
    assert!(rig.flash().is_erased(PartitionId::SlotB));
}

#[test]
fn unreachable_manifest_after_a_failure_reports_idle() {
    let mut rig = Rig::new(RigOptions::default());
    let image = app_image(8_192);
    serve_release(
        &rig.http,
        12,
        &image,
        Reply::Truncated {
            declared: image.len() as u64,
            body: image[..4_096].to_vec(),
        },
    );

    let t0 = Instant::now();
    rig.tick(t0);
    assert_eq!(rig.state.snapshot().ota, OtaStatus::Failed);

    rig.http.set(
        &join_url(BASE_URL, MANIFEST_FILE),
        Reply::Fail(NetworkError::Unreachable("fw.test".into())),
    );
    rig.tick(t0 + OTA_PERIOD);
    assert_eq!(rig.state.snapshot().ota, OtaStatus::Idle);
    assert_eq!(rig.flash().boot_changes(), 0);
}

#[test]
fn timeout_before_any_image_byte_discards_the_session() {
    let mut rig = Rig::new(RigOptions::default());
    let image = app_image(4_096);
    serve_release(&rig.http, 12, &image, Reply::TimeoutAfter { body: image.clone(), after: 0 });

    rig.tick(Instant::now());

    assert_eq!(rig.state.snapshot().ota, OtaStatus::Failed);
    assert_eq!(rig.flash().boot_target(), PartitionId::SlotA);
    assert!(rig.flash().is_erased(PartitionId::SlotB));
}

#[test]
fn release_in_a_subdirectory_is_fetched_from_there() {
    let mut rig = Rig::new(RigOptions::default());
    let image = app_image(2_048);
    rig.http
        .set(&join_url(BASE_URL, MANIFEST_FILE), Reply::ok(b"builds/c6-co0012.bin\n".to_vec()));
    rig.http
        .set(&join_url(BASE_URL, "builds/c6-co0012.bin"), Reply::ok(image.clone()));

    rig.tick(Instant::now());

    assert_eq!(rig.flash().boot_target(), PartitionId::SlotB);
    assert_eq!(rig.flash().contents(PartitionId::SlotB), &image[..]);
}

#[test]
fn outage_defers_the_check_to_the_next_cadence() {
    let mut rig = Rig::new(RigOptions::default());
    let image = app_image(2_048);
    serve_release(&rig.http, 12, &image, Reply::ok(image.clone()));
    rig.link.set_up(false);

    let t0 = Instant::now();
    rig.tick(t0);
    assert!(rig.http.requests().is_empty());
    assert!(!rig.state.snapshot().network_up);

    rig.link.set_up(true);
    rig.tick(t0 + Duration::from_secs(1));
    assert!(rig.http.requests().is_empty());

    rig.tick(t0 + OTA_PERIOD);
    assert_eq!(rig.flash().boot_target(), PartitionId::SlotB);
}

#[test]
fn running_image_is_confirmed_at_start() {
    let rig = Rig::new(RigOptions::default());
    assert!(rig.flash().running_marked_valid());
}
