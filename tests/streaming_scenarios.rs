//! End-to-end sessions against the simulated platform.
//!
//! All tests run on tokio's paused clock, so tick boundaries are exact: at
//! 100 Hz tick `k` fires at `k * 10ms` after `start()`.

use forceplate_daq::config::NodeOptions;
use forceplate_daq::diagnostics::DiagnosticsState;
use forceplate_daq::error::{ErrorKind, SessionError};
use forceplate_daq::hardware::SimulatedPlatform;
use forceplate_daq::node::{NodeEvent, StreamingNode};
use forceplate_daq::sample::{GapReason, TaggedSample};
use forceplate_daq::store::{ConfigStore, DeviceConfig};
use forceplate_daq::zero::PostOutcome;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};

// =============================================================================
// Helpers
// =============================================================================

fn test_options(dir: &TempDir) -> NodeOptions {
    NodeOptions {
        sample_rate: 100,
        config_path: dir.path().to_path_buf(),
        auto_zero: false,
        ..Default::default()
    }
}

fn node_for(platform: &SimulatedPlatform, options: NodeOptions) -> StreamingNode {
    let store = ConfigStore::from_options(&options);
    StreamingNode::new(options, Arc::new(platform.clone()), store)
}

fn drain(rx: &mut mpsc::Receiver<TaggedSample>) -> Vec<TaggedSample> {
    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    records
}

fn drain_events(rx: &mut broadcast::Receiver<NodeEvent>) -> Vec<NodeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn assert_contiguous(records: &[TaggedSample]) {
    for (expected, record) in records.iter().enumerate() {
        assert_eq!(record.tick, expected as u64, "tick sequence broken");
    }
}

// =============================================================================
// Cadence
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_one_record_per_tick() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let node = node_for(&platform, test_options(&dir));

    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(995)).await;
    let summary = node.stop().await.unwrap();

    let records = drain(&mut rx);
    assert_eq!(records.len(), 100);
    assert_contiguous(&records);
    assert!(records.iter().all(|r| !r.gap && r.is_valid()));

    assert_eq!(summary.ticks, 100);
    assert_eq!(summary.samples, 100);
    assert_eq!(summary.gaps, 0);
    assert!(!summary.forced);
    assert!(summary.fault.is_none());

    // Device timestamps follow the sample index
    let last = records[99].sample.as_ref().unwrap();
    assert!((last.timestamp - 0.99).abs() < 1e-9);
    assert_eq!(last.readings.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_layout_shared_by_every_record() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let node = node_for(&platform, test_options(&dir));

    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(45)).await;
    node.stop().await.unwrap();

    let records = drain(&mut rx);
    assert_eq!(records.len(), 5);
    let layout = Arc::clone(&records[0].layout);
    assert_eq!(layout.serial, "SIM-0001");
    assert_eq!(layout.sample_rate, 100);
    assert_eq!(layout.names, vec!["Fx", "Fy", "Fz", "Mx", "My", "Mz"]);
    assert!(records.iter().all(|r| Arc::ptr_eq(&r.layout, &layout)));
}

// =============================================================================
// Zero episodes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_zero_mid_stream_emits_gaps() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.set_tare_latency(Duration::from_millis(200));
    let node = node_for(&platform, test_options(&dir));
    let mut events = node.events();

    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(495)).await;
    assert!(matches!(
        node.zero_trigger().request("operator"),
        PostOutcome::Accepted(_)
    ));
    sleep(Duration::from_millis(500)).await;
    let summary = node.stop().await.unwrap();

    let records = drain(&mut rx);
    assert_eq!(records.len(), 100);
    assert_contiguous(&records);

    for record in &records[..50] {
        assert!(!record.gap, "tick {} should carry a sample", record.tick);
    }
    for record in &records[50..70] {
        assert!(record.gap, "tick {} should be a zeroing gap", record.tick);
        assert_eq!(record.gap_reason, Some(GapReason::Zeroing));
        assert!(record.sample.is_none());
    }
    for record in &records[70..] {
        assert!(!record.gap, "tick {} should carry a sample", record.tick);
    }

    // Fz reads body weight before the tare and ~0 after it
    let before = records[10].sample.as_ref().unwrap();
    assert!(before.readings[2] > 600.0);
    let after = records[70].sample.as_ref().unwrap();
    assert!(after.readings.iter().all(|v| v.abs() < 0.1));

    assert_eq!(summary.gaps, 20);
    assert_eq!(summary.samples, 80);
    assert_eq!(summary.zero_episodes, 1);
    assert_eq!(summary.zero_failures, 0);
    assert_eq!(platform.tare_count(), 1);

    let completed: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            NodeEvent::ZeroCompleted(outcome) => Some(outcome),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].request.actor, "operator");
    assert_eq!(completed[0].elapsed, Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_zero_requests_coalesce() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.set_tare_latency(Duration::from_millis(200));
    let node = node_for(&platform, test_options(&dir));
    let trigger = node.zero_trigger();

    let _rx = node.start().await.unwrap();
    sleep(Duration::from_millis(495)).await;

    let PostOutcome::Accepted(first) = trigger.request("operator") else {
        panic!("first request should be accepted");
    };
    assert_eq!(
        trigger.request("pipeline"),
        PostOutcome::Coalesced { pending: first }
    );

    // Mid-episode
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        trigger.request("operator"),
        PostOutcome::Coalesced { pending: first }
    );

    sleep(Duration::from_millis(300)).await;
    let summary = node.stop().await.unwrap();
    assert_eq!(platform.tare_count(), 1);
    assert_eq!(summary.zero_episodes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_keeps_streaming() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.set_tare_latency(Duration::from_secs(5));
    let options = NodeOptions {
        tare_timeout: Duration::from_millis(300),
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);
    let mut events = node.events();

    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(95)).await;
    node.zero_trigger().request("operator");
    sleep(Duration::from_millis(600)).await;
    let summary = node.stop().await.unwrap();

    let records = drain(&mut rx);
    assert_contiguous(&records);
    // Ticks 10..40 are gaps while the tare is outstanding
    assert!(records[10..40].iter().all(|r| r.gap));
    assert!(!records[40].gap);
    assert!(records[2].sample.as_ref().unwrap().readings[2] > 600.0);
    // Offset unchanged after the failed tare
    assert!(records[45].sample.as_ref().unwrap().readings[2] > 600.0);

    assert_eq!(summary.zero_failures, 1);
    assert!(summary.fault.is_none());
    assert!(drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, NodeEvent::ZeroFailed(outcome) if outcome.error.is_some())));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_zero_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.reject_tares(true);
    let node = node_for(&platform, test_options(&dir));

    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(55)).await;
    node.zero_trigger().request("operator");
    sleep(Duration::from_millis(100)).await;
    assert!(node.is_running().await);
    let summary = node.stop().await.unwrap();

    let records = drain(&mut rx);
    assert_contiguous(&records);
    assert_eq!(summary.zero_failures, 1);
    assert_eq!(summary.gaps, 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_refused_when_not_streaming() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let node = node_for(&platform, test_options(&dir));
    let trigger = node.zero_trigger();

    assert_eq!(trigger.request("operator"), PostOutcome::NotStreaming);

    let _rx = node.start().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    node.stop().await.unwrap();

    assert_eq!(trigger.request("operator"), PostOutcome::NotStreaming);
    assert_eq!(platform.tare_count(), 0);
}

// =============================================================================
// Diagnostics
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_informational_codes_are_benign() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.set_default_status(214);
    platform.push_status(250, 0);
    let options = NodeOptions {
        diagnostics_interval: 1,
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);
    let mut events = node.events();

    let _rx = node.start().await.unwrap();
    sleep(Duration::from_millis(195)).await;
    assert!(node.is_running().await);
    let summary = node.stop().await.unwrap();
    assert_eq!(summary.transient_faults, 0);
    assert_eq!(summary.last_status.map(|status| status.code), Some(214));

    let transitions: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            NodeEvent::Diagnostics { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![DiagnosticsState::Polling, DiagnosticsState::Idle]
    );
}

#[tokio::test(start_paused = true)]
async fn test_fault_codes_exhaust_retry_budget() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.set_default_status(450);
    let options = NodeOptions {
        diagnostics_interval: 1,
        retry_budget: 3,
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);
    let mut events = node.events();

    let mut rx = node.start().await.unwrap();
    let mut records = Vec::new();
    while let Some(record) = rx.recv().await {
        records.push(record);
    }
    assert_eq!(records.len(), 2);
    assert!(!node.is_running().await);
    assert!(!platform.is_claimed());

    let summary = node.stop().await.unwrap();
    assert_eq!(summary.diagnostics, DiagnosticsState::Faulted);
    assert!(summary.fault.unwrap().contains("450"));

    let events = drain_events(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        NodeEvent::Diagnostics {
            to: DiagnosticsState::Degraded,
            tick: 0,
            ..
        }
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        NodeEvent::SessionFault {
            kind: ErrorKind::Connection,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_missed_reads_degrade_then_recover() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.hang_reads(true);
    let options = NodeOptions {
        read_timeout: Duration::from_millis(5),
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);
    let mut events = node.events();

    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(12)).await;
    platform.hang_reads(false);
    sleep(Duration::from_millis(43)).await;
    let summary = node.stop().await.unwrap();

    let records = drain(&mut rx);
    assert_contiguous(&records);
    assert_eq!(records[0].gap_reason, Some(GapReason::MissedRead));
    assert_eq!(records[1].gap_reason, Some(GapReason::MissedRead));
    assert!(records[2..].iter().all(|r| !r.gap));
    assert_eq!(summary.missed_reads, 2);
    assert_eq!(summary.transient_faults, 2);
    assert!(summary.fault.is_none());

    let transitions: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            NodeEvent::Diagnostics { from, to, tick } => Some((from, to, tick)),
            _ => None,
        })
        .collect();
    assert!(transitions.contains(&(DiagnosticsState::Polling, DiagnosticsState::Degraded, 0)));
    assert!(transitions.contains(&(DiagnosticsState::Degraded, DiagnosticsState::Polling, 2)));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_ends_session() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let node = node_for(&platform, test_options(&dir));
    let mut events = node.events();

    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(95)).await;
    platform.disconnect();

    let mut remaining = 0;
    while rx.recv().await.is_some() {
        remaining += 1;
    }
    assert!(remaining <= 10);
    assert!(!platform.is_claimed());

    let summary = node.stop().await.unwrap();
    assert!(summary.fault.unwrap().contains("disconnected"));
    assert_eq!(summary.diagnostics, DiagnosticsState::Faulted);

    // Config readback fails on a dead platform; the last applied one is persisted
    let store = ConfigStore::new(dir.path());
    assert!(store.load("SIM-0001").is_some());
    assert!(drain_events(&mut events).iter().any(|event| matches!(
        event,
        NodeEvent::SessionFault {
            kind: ErrorKind::Connection,
            ..
        }
    )));
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_persisted_config_wins_over_options() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    let persisted = DeviceConfig {
        channel_gains: vec![2.0, 2.0, 4.0, 1.0, 1.0, 1.0],
        excitation_voltage: 5.0,
        ..DeviceConfig::unity("SIM-0001", 6, 5.0)
    };
    store.save("SIM-0001", &persisted).unwrap();

    let platform = SimulatedPlatform::new();
    let options = NodeOptions {
        device_serial: Some("SIM-0001".to_string()),
        channel_gains: vec![8.0; 6],
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);
    let _rx = node.start().await.unwrap();
    assert_eq!(platform.applied_config(), Some(persisted));
    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_record_for_opened_serial_wins_without_configured_serial() {
    let dir = TempDir::new().unwrap();
    let persisted = DeviceConfig {
        channel_gains: vec![4.0; 6],
        ..DeviceConfig::unity("SIM-0001", 6, 5.0)
    };
    ConfigStore::new(dir.path()).save("SIM-0001", &persisted).unwrap();

    let platform = SimulatedPlatform::new();
    let options = NodeOptions {
        channel_gains: vec![8.0; 6],
        ..test_options(&dir)
    };
    assert!(options.device_serial.is_none());
    let node = node_for(&platform, options);
    let _rx = node.start().await.unwrap();
    assert_eq!(platform.applied_config(), Some(persisted));
    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_options_apply_without_persisted_config() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let options = NodeOptions {
        channel_gains: vec![2.0; 6],
        excitation_voltage: 5.0,
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);
    let _rx = node.start().await.unwrap();
    let applied = platform.applied_config().unwrap();
    assert_eq!(applied.channel_gains, vec![2.0; 6]);
    assert_eq!(applied.excitation_voltage, 5.0);
    node.stop().await.unwrap();

    let saved = ConfigStore::new(dir.path()).load("SIM-0001").unwrap();
    assert_eq!(saved, applied);
}

#[tokio::test(start_paused = true)]
async fn test_config_mismatch_releases_device() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::new(dir.path());
    store
        .save("SIM-0001", &DeviceConfig::unity("SIM-0001", 4, 10.0))
        .unwrap();

    let platform = SimulatedPlatform::new();
    let options = NodeOptions {
        device_serial: Some("SIM-0001".to_string()),
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);

    let err = node.start().await.unwrap_err();
    assert!(matches!(err, SessionError::ConfigMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::ConfigMismatch);
    assert!(!platform.is_claimed());
    assert_eq!(platform.open_count(), 1);
    assert_eq!(platform.close_count(), 1);
    assert!(!node.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_configuration_is_mismatch() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.reject_config(true);
    let node = node_for(&platform, test_options(&dir));

    let err = node.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigMismatch);
    assert!(!platform.is_claimed());
}

#[tokio::test(start_paused = true)]
async fn test_missing_platform_is_connection_error() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.set_present(false);
    let node = node_for(&platform, test_options(&dir));

    let err = node.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_save_config_while_streaming() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let node = node_for(&platform, test_options(&dir));
    let store = ConfigStore::new(dir.path());

    let _rx = node.start().await.unwrap();
    assert!(store.load("SIM-0001").is_none());
    node.save_config().await.unwrap();
    assert_eq!(store.load("SIM-0001"), platform.applied_config());
    node.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_persistence_failure_is_a_warning() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let platform = SimulatedPlatform::new();
    let options = NodeOptions {
        sample_rate: 100,
        auto_zero: false,
        // A regular file where the store expects a directory
        config_path: blocker.path().join("devices"),
        ..Default::default()
    };
    let node = node_for(&platform, options);
    let mut events = node.events();

    let _rx = node.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let summary = node.stop().await.unwrap();
    assert!(summary.fault.is_none());
    assert!(!platform.is_claimed());
    assert!(drain_events(&mut events)
        .iter()
        .any(|event| matches!(event, NodeEvent::PersistenceWarning { .. })));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_repeated_sessions_release_device() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let node = node_for(&platform, test_options(&dir));

    for cycle in 0..5u64 {
        let mut rx = node.start().await.unwrap();
        sleep(Duration::from_millis(95)).await;
        let summary = node.stop().await.unwrap();
        assert_eq!(summary.ticks, 10, "cycle {}", cycle);
        assert_eq!(drain(&mut rx).len(), 10);
        assert!(!platform.is_claimed());
    }
    assert_eq!(platform.open_count(), 5);
    assert_eq!(platform.close_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_second_node_sees_busy_platform() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let first = node_for(&platform, test_options(&dir));
    let second = node_for(&platform, test_options(&dir));

    let _rx = first.start().await.unwrap();
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, SessionError::Connection(ref e) if e.is_busy()));
    first.stop().await.unwrap();

    let _rx = second.start().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_forces_teardown_after_grace() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.hang_reads(true);
    let options = NodeOptions {
        read_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_millis(500),
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);

    let _rx = node.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let summary = node.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(summary.forced);
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(600), "stop took {:?}", elapsed);
    assert!(!platform.is_claimed());
    assert!(ConfigStore::new(dir.path()).load("SIM-0001").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_forced_stop_closes_zero_mailbox() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    platform.hang_reads(true);
    let options = NodeOptions {
        read_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_millis(500),
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);
    let trigger = node.zero_trigger();

    let _rx = node.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    // Posted while the loop is stuck in a read, so never taken
    assert!(matches!(trigger.request("operator"), PostOutcome::Accepted(_)));

    let summary = node.stop().await.unwrap();
    assert!(summary.forced);
    assert!(!trigger.is_busy());
    assert_eq!(trigger.request("operator"), PostOutcome::NotStreaming);

    platform.hang_reads(false);
    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(15)).await;
    let summary = node.stop().await.unwrap();

    let records = drain(&mut rx);
    assert_eq!(records[0].tick, 0);
    assert!(!records[0].gap);
    assert_eq!(summary.zero_episodes, 0);
    assert_eq!(platform.tare_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_consumer_does_not_stall_acquisition() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let options = NodeOptions {
        output_capacity: 4,
        ..test_options(&dir)
    };
    let node = node_for(&platform, options);

    // Never read until the session is over
    let mut rx = node.start().await.unwrap();
    sleep(Duration::from_millis(195)).await;

    let started = Instant::now();
    let summary = node.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(!summary.forced);
    assert!(elapsed < Duration::from_millis(50), "stop took {:?}", elapsed);
    assert_eq!(summary.ticks, 20);
    assert_eq!(summary.samples, 20);
    assert_eq!(summary.overflows, 16);
    assert!(!platform.is_claimed());

    let records = drain(&mut rx);
    assert_eq!(records.len(), 4);
    assert_contiguous(&records);
    assert!(records[0].report.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_consumer_ends_session() {
    let dir = TempDir::new().unwrap();
    let platform = SimulatedPlatform::new();
    let node = node_for(&platform, test_options(&dir));

    let rx = node.start().await.unwrap();
    sleep(Duration::from_millis(25)).await;
    drop(rx);
    sleep(Duration::from_millis(20)).await;

    assert!(!node.is_running().await);
    assert!(!platform.is_claimed());
    let summary = node.stop().await.unwrap();
    assert!(!summary.forced);
}
