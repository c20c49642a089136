//! Options loading and the per-device configuration store.

use forceplate_daq::config::{NodeOptions, DEFAULT_OPTIONS_FILE};
use forceplate_daq::diagnostics::{CodeBand, StatusClass};
use forceplate_daq::store::{ConfigStore, DeviceConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_shipped_options_file_is_valid() {
    let options = NodeOptions::load_from(DEFAULT_OPTIONS_FILE).unwrap();
    options.validate().unwrap();

    assert_eq!(options.sample_rate, 500);
    assert_eq!(options.read_timeout, Duration::from_millis(100));
    assert_eq!(options.tare_timeout, Duration::from_secs(1));
    assert_eq!(options.channel_gains, vec![1.0; 6]);
    assert!(options.auto_zero);
    assert_eq!(options.status_policy.benign_bands, vec![CodeBand::new(200, 299)]);
    assert_eq!(options.status_policy.classify(214), StatusClass::Benign);
    assert_eq!(options.status_policy.classify(503), StatusClass::Fault);
}

#[test]
fn test_environment_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "sample_rate = 250\nretry_budget = 2").unwrap();

    std::env::set_var("FORCEPLATE_SAMPLE_RATE", "1000");
    std::env::set_var("FORCEPLATE_STATUS_POLICY__BENIGN_CODES", "[0, 7]");
    let loaded = NodeOptions::load_from(file.path());
    std::env::remove_var("FORCEPLATE_SAMPLE_RATE");
    std::env::remove_var("FORCEPLATE_STATUS_POLICY__BENIGN_CODES");

    let options = loaded.unwrap();
    assert_eq!(options.sample_rate, 1000);
    assert_eq!(options.retry_budget, 2);
    assert_eq!(options.status_policy.benign_codes, vec![0, 7]);
    // Untouched nested keys keep their defaults
    assert_eq!(options.status_policy.fault_bands, vec![CodeBand::new(400, 599)]);
}

#[test]
fn test_store_round_trip_and_isolation() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());

    let mut pf1 = DeviceConfig::unity("PF001", 6, 10.0);
    pf1.channel_gains[2] = 4.0;
    let pf2 = DeviceConfig::unity("PF002", 6, 5.0);
    store.save("PF001", &pf1).unwrap();
    store.save("PF002", &pf2).unwrap();

    assert_eq!(store.load("PF001"), Some(pf1.clone()));
    assert_eq!(store.load("PF002"), Some(pf2));
    assert_eq!(store.load("PF003"), None);

    // Last write wins; no temp file left behind
    pf1.excitation_voltage = 2.5;
    store.save("PF001", &pf1).unwrap();
    assert_eq!(store.load("PF001").unwrap().excitation_voltage, 2.5);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_corrupt_record_falls_back_to_default() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    std::fs::write(store.path_for("PF001"), "channel_gains = \"not a list\"").unwrap();

    assert_eq!(store.load("PF001"), None);
    let fallback = DeviceConfig::unity("PF001", 6, 10.0);
    assert_eq!(store.load_or("PF001", fallback.clone()), fallback);
}

#[test]
fn test_record_for_other_serial_is_ignored() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    store
        .save("PF001", &DeviceConfig::unity("PF999", 6, 10.0))
        .unwrap();
    assert_eq!(store.load("PF001"), None);
}
