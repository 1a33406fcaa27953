//! Isolated scratch directories for integration tests and benches.
//!
//! Each environment owns a `TempDir` and hands out uniquely named transport
//! file paths, so concurrent tests never collide on disk.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Scratch directory for transport files; removed on drop.
pub struct TestEnvironment {
    _temp_dir: TempDir,
    root: PathBuf,
    test_id: u32,
}

impl TestEnvironment {
    /// Create a fresh, isolated environment.
    pub fn new() -> std::io::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();
        Ok(Self {
            _temp_dir: temp_dir,
            root,
            test_id,
        })
    }

    /// A transport file path unique to this environment.
    pub fn transport_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}-{}.mmtel", self.test_id))
    }
}
