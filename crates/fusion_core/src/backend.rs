//! # Backends
//!
//! Where pool memory comes from and how calls reach their handlers.
//!
//! | Backend | Pool memory | Calls |
//! |---------|-------------|-------|
//! | [`SharedBackend`] | mapped files under the tmpfs directory | queued to the owner's dispatcher |
//! | [`FakeBackend`] | process heap | invoked directly on the caller's thread |
//!
//! Both expose the same operations and semantics, the fake one only lacks
//! sharing with foreign processes.
//!
//! Foreign processes share pool bytes only: they map a pool file with
//! [`SharedBackend::open_storage`] and find allocations through offsets
//! handed over by the creating process. Membership, calls and reactors stay
//! inside the process that hosts the world.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::FusionConfig;
use crate::error::{FusionError, FusionResult};
use crate::id::PoolId;
use crate::memory::{HeapStorage, MappedStorage, PoolStorage};

/// Prefix of every shared memory file.
pub const SHM_FILE_PREFIX: &str = "fusion";

/// Backend flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Mapped files that foreign processes can open.
    Shared,
    /// Single process, heap memory.
    Fake,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Fake => f.write_str("fake"),
        }
    }
}

/// Provider of pool memory and call routing policy.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Which flavour this is.
    fn kind(&self) -> BackendKind;

    /// Checks that the backend can operate under `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a required resource is missing.
    fn prepare(&self, config: &FusionConfig) -> FusionResult<()>;

    /// Releases process-wide resources.
    fn cleanup(&self) {}

    /// Creates the bytes of a new pool.
    ///
    /// # Errors
    ///
    /// [`FusionError::OutOfMemory`] or [`FusionError::Io`] if the memory
    /// cannot be obtained.
    fn create_storage(
        &self,
        config: &FusionConfig,
        world: u32,
        pool: PoolId,
        size: usize,
    ) -> FusionResult<Box<dyn PoolStorage>>;

    /// Returns true if calls run on the caller's thread.
    fn direct_calls(&self) -> bool;
}

/// Mapped-file backend.
#[derive(Debug, Default)]
pub struct SharedBackend {
    next_file: AtomicU64,
}

impl SharedBackend {
    /// Creates the backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn file_path(&self, config: &FusionConfig, world: u32, pool: PoolId) -> PathBuf {
        let serial = self.next_file.fetch_add(1, Ordering::Relaxed);
        config.shm_dir().join(format!(
            "{SHM_FILE_PREFIX}.{world}.{}.{}.{serial}",
            pool.0,
            std::process::id()
        ))
    }

    /// Maps the pool file at `path`, created by this or another process.
    ///
    /// # Errors
    ///
    /// [`FusionError::Io`] if the file cannot be opened or mapped,
    /// [`FusionError::AccessDenied`] if it is outside the tmpfs directory.
    pub fn open_storage(&self, config: &FusionConfig, path: &Path) -> FusionResult<MappedStorage> {
        let dir = config.shm_dir();
        let inside = path.parent().is_some_and(|parent| parent == dir.as_path())
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(SHM_FILE_PREFIX));
        if !inside {
            return Err(FusionError::AccessDenied(format!(
                "{} is not a pool file under {}",
                path.display(),
                dir.display()
            )));
        }
        tracing::debug!("Opening pool file {}", path.display());
        MappedStorage::open(path.to_path_buf())
    }
}

impl Backend for SharedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    fn prepare(&self, config: &FusionConfig) -> FusionResult<()> {
        let dir = config.shm_dir();
        let meta = std::fs::metadata(&dir)
            .map_err(|e| FusionError::Io(format!("shared memory directory {}: {e}", dir.display())))?;
        if !meta.is_dir() {
            return Err(FusionError::Config(format!("tmpfs: {} is not a directory", dir.display())));
        }
        if meta.permissions().readonly() {
            return Err(FusionError::AccessDenied(format!("{} is read-only", dir.display())));
        }
        tracing::info!("Shared memory files go to {}", dir.display());
        Ok(())
    }

    fn create_storage(
        &self,
        config: &FusionConfig,
        world: u32,
        pool: PoolId,
        size: usize,
    ) -> FusionResult<Box<dyn PoolStorage>> {
        let path = self.file_path(config, world, pool);
        tracing::debug!("Mapping {} bytes at {}", size, path.display());
        let storage = MappedStorage::create(path, size, config.shmfile_group)?;
        Ok(Box::new(storage))
    }

    fn direct_calls(&self) -> bool {
        false
    }
}

/// Single-process backend over heap memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeBackend;

impl FakeBackend {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Backend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fake
    }

    fn prepare(&self, _config: &FusionConfig) -> FusionResult<()> {
        Ok(())
    }

    fn create_storage(
        &self,
        _config: &FusionConfig,
        _world: u32,
        _pool: PoolId,
        size: usize,
    ) -> FusionResult<Box<dyn PoolStorage>> {
        Ok(Box::new(HeapStorage::new(size)?))
    }

    fn direct_calls(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(tag: &str) -> (FusionConfig, PathBuf) {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("fusion_backend_{tag}_{id}"));
        std::fs::create_dir_all(&dir).unwrap();
        let config = FusionConfig {
            tmpfs: Some(dir.clone()),
            ..FusionConfig::default()
        };
        (config, dir)
    }

    #[test]
    fn test_shared_backend_creates_unique_files() {
        let (config, dir) = temp_config("files");
        let backend = SharedBackend::new();
        backend.prepare(&config).unwrap();

        let a = backend.create_storage(&config, 0, PoolId(1), 4096).unwrap();
        let b = backend.create_storage(&config, 0, PoolId(1), 4096).unwrap();
        let path_a = a.path().unwrap().to_path_buf();
        assert_ne!(Some(path_a.as_path()), b.path());
        assert!(path_a.starts_with(&dir));
        assert!(path_a.exists());

        drop(a);
        drop(b);
        assert!(!path_a.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_open_storage_maps_existing_pool_file() {
        let (config, dir) = temp_config("open");
        let backend = SharedBackend::new();
        let mut created = backend.create_storage(&config, 0, PoolId(3), 4096).unwrap();
        let path = created.path().unwrap().to_path_buf();
        created.as_mut_slice()[..5].copy_from_slice(b"hello");

        let opened = backend.open_storage(&config, &path).unwrap();
        assert_eq!(&opened.as_slice()[..5], b"hello");

        let outside = std::env::temp_dir().join("fusion.outside");
        assert!(matches!(
            backend.open_storage(&config, &outside),
            Err(FusionError::AccessDenied(_))
        ));

        drop(opened);
        drop(created);
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_shared_backend_rejects_missing_dir() {
        let config = FusionConfig {
            tmpfs: Some(PathBuf::from("/nonexistent/fusion/shm")),
            ..FusionConfig::default()
        };
        assert!(SharedBackend::new().prepare(&config).is_err());
    }

    #[test]
    fn test_fake_backend_is_direct() {
        let backend = FakeBackend::new();
        assert!(backend.direct_calls());
        assert_eq!(backend.kind(), BackendKind::Fake);
        let storage = backend
            .create_storage(&FusionConfig::default(), 0, PoolId(1), 64)
            .unwrap();
        assert!(storage.path().is_none());
        assert_eq!(storage.as_slice().len(), 64);
    }
}
