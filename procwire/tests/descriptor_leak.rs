//! A failed spawn must release every descriptor it opened.
//!
//! Lives in its own test binary so no concurrently running test can open or
//! close descriptors between the two counts.

#![cfg(target_os = "linux")]

use procwire::{spawn, Configuration, Error, ProcessMonitor, Stdio};

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[tokio::test]
async fn test_failed_spawn_closes_every_descriptor() {
    // Install the reaper and its signal listener before counting.
    ProcessMonitor::global().unwrap();
    let config = Configuration::new("/nonexistent/procwire-leak-check");

    // Warm up lazily opened descriptors such as /dev/null.
    let _ = spawn(&config, Stdio::Null, Stdio::Piped, Stdio::Piped);

    let before = open_descriptors();
    for _ in 0..8 {
        let err = spawn(&config, Stdio::Piped, Stdio::Piped, Stdio::Piped).unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }
    let after = open_descriptors();

    assert_eq!(before, after);
}
