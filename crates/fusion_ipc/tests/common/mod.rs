//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use fusion_core::FusionConfig;
use fusion_ipc::Registry;

/// Fresh directory for the shared memory files of one test.
pub fn temp_shm_dir(tag: &str) -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("fusion_test_{tag}_{}_{id}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Registry on file-backed pools in a private directory.
pub fn shared_registry(tag: &str, config: FusionConfig) -> Registry {
    Registry::shared(FusionConfig {
        tmpfs: Some(temp_shm_dir(tag)),
        ..config
    })
    .unwrap()
}

/// One registry per backend, named for assertion messages.
pub fn both_backends(tag: &str, config: FusionConfig) -> Vec<(&'static str, Registry)> {
    vec![
        ("fake", Registry::fake(config.clone()).unwrap()),
        ("shared", shared_registry(tag, config)),
    ]
}

/// Polls `condition` until it holds or two seconds pass.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
