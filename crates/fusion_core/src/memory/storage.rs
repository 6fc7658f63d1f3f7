//! # Pool Storage
//!
//! The bytes behind an SHM pool: a memory-mapped file that other processes
//! can map, or a plain heap block for single-process deployments.
//!
//! ## Safety Note
//!
//! Mapping a file is unsafe because another process may truncate it while it
//! is mapped. Pool files are created exclusively by their owner, sized once,
//! and unlinked only when the owner drops the mapping. Other processes map
//! them with [`MappedStorage::open`], which never resizes or unlinks.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{FusionError, FusionResult};

/// Backing bytes of a pool.
pub trait PoolStorage: Send + Sync {
    /// Read access to the whole region.
    fn as_slice(&self) -> &[u8];

    /// Write access to the whole region.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Releases the contents of a freed range.
    fn discard(&mut self, offset: usize, len: usize) {
        self.as_mut_slice()[offset..offset + len].fill(0);
    }

    /// Location of the backing file, if any.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Writes dirty pages back to the backing file.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::Io`] if the flush fails.
    fn flush(&self) -> FusionResult<()> {
        Ok(())
    }
}

/// Process-local heap storage.
pub struct HeapStorage {
    bytes: Box<[u8]>,
}

impl HeapStorage {
    /// Allocates `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::OutOfMemory`] if the heap refuses the reservation.
    pub fn new(size: usize) -> FusionResult<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).map_err(|_| FusionError::OutOfMemory {
            requested: size,
            available: 0,
        })?;
        bytes.resize(size, 0);
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }
}

impl PoolStorage for HeapStorage {
    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Shared memory file mapped read-write.
///
/// The file is unlinked when the creating storage is dropped.
pub struct MappedStorage {
    map: MmapMut,
    /// Kept open for the lifetime of the mapping.
    _file: File,
    path: PathBuf,
    owned: bool,
}

impl MappedStorage {
    /// Creates and maps a new file of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`FusionError::Io`] if the file cannot be created or mapped,
    /// [`FusionError::OutOfMemory`] if the file system cannot hold `size` bytes.
    pub fn create(path: PathBuf, size: usize, group: Option<u32>) -> FusionResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let result = Self::map_new(&file, &path, size, group);
        match result {
            Ok(map) => Ok(Self {
                map,
                _file: file,
                path,
                owned: true,
            }),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Maps a pool file created by another storage, possibly in another
    /// process. Writes through either mapping are visible to both.
    ///
    /// # Errors
    ///
    /// [`FusionError::Io`] if the file cannot be opened or mapped,
    /// [`FusionError::InvalidState`] if it is empty.
    pub fn open(path: PathBuf) -> FusionResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() == 0 {
            return Err(FusionError::InvalidState(format!("{} is empty", path.display())));
        }

        // SAFETY: pool files keep their size until the creator unlinks them,
        // and unlinking leaves existing mappings valid.
        let map = unsafe { MmapMut::map_mut(&file) }?;
        Ok(Self {
            map,
            _file: file,
            path,
            owned: false,
        })
    }

    /// Returns true if dropping this storage unlinks the file.
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        self.owned
    }

    fn map_new(file: &File, path: &Path, size: usize, group: Option<u32>) -> FusionResult<MmapMut> {
        file.set_len(size as u64).map_err(|e| match e.raw_os_error() {
            // EFBIG, ENOSPC
            Some(27 | 28) => FusionError::OutOfMemory {
                requested: size,
                available: 0,
            },
            _ => FusionError::from(e),
        })?;

        if let Some(gid) = group {
            set_group(path, gid)?;
        }

        // SAFETY: the file was created exclusively above and is only resized
        // here, before the mapping exists.
        let map = unsafe { MmapMut::map_mut(file) }?;
        Ok(map)
    }
}

#[cfg(unix)]
fn set_group(path: &Path, gid: u32) -> FusionResult<()> {
    std::os::unix::fs::chown(path, None, Some(gid))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_group(_path: &Path, _gid: u32) -> FusionResult<()> {
    Err(FusionError::Unimplemented("shared memory file group ownership"))
}

impl PoolStorage for MappedStorage {
    fn as_slice(&self) -> &[u8] {
        &self.map
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn flush(&self) -> FusionResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

impl Drop for MappedStorage {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Could not unlink shared memory file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fusion_storage_{tag}_{}_{id}", std::process::id()))
    }

    #[test]
    fn test_heap_storage_zeroed() {
        let storage = HeapStorage::new(128).unwrap();
        assert_eq!(storage.as_slice().len(), 128);
        assert!(storage.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mapped_storage_visible_through_file() {
        let path = temp_path("visible");
        let mut storage = MappedStorage::create(path.clone(), 4096, None).unwrap();
        storage.as_mut_slice()[..4].copy_from_slice(b"FUSN");
        storage.flush().unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 4096);
        assert_eq!(&on_disk[..4], b"FUSN");

        drop(storage);
        assert!(!path.exists());
    }

    #[test]
    fn test_mapped_storage_refuses_existing_file() {
        let path = temp_path("exists");
        std::fs::write(&path, b"taken").unwrap();
        assert!(MappedStorage::create(path.clone(), 64, None).is_err());
        // The pre-existing file is not ours to remove
        assert!(path.exists());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_opened_mapping_shares_bytes() {
        let path = temp_path("shared");
        let mut creator = MappedStorage::create(path.clone(), 4096, None).unwrap();
        let mut opened = MappedStorage::open(path.clone()).unwrap();
        assert!(creator.is_owner());
        assert!(!opened.is_owner());
        assert_eq!(opened.as_slice().len(), 4096);

        creator.as_mut_slice()[100..104].copy_from_slice(b"PING");
        assert_eq!(&opened.as_slice()[100..104], b"PING");
        opened.as_mut_slice()[200..204].copy_from_slice(b"PONG");
        assert_eq!(&creator.as_slice()[200..204], b"PONG");

        // Only the creator unlinks
        drop(opened);
        assert!(path.exists());
        drop(creator);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_refuses_missing_or_empty_file() {
        let path = temp_path("missing");
        assert!(matches!(MappedStorage::open(path.clone()), Err(FusionError::Io(_))));

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(MappedStorage::open(path.clone()), Err(FusionError::InvalidState(_))));
        std::fs::remove_file(&path).ok();
    }

    const CHILD_PATH_VAR: &str = "FUSION_STORAGE_CHILD_PATH";

    /// Body of the child process spawned by `test_second_process_sees_writes`.
    #[test]
    fn test_child_writes_through_opened_mapping() {
        let Some(path) = std::env::var_os(CHILD_PATH_VAR) else {
            return;
        };
        let mut storage = MappedStorage::open(PathBuf::from(path)).unwrap();
        assert_eq!(&storage.as_slice()[..4], b"FUSN");
        storage.as_mut_slice()[4..8].copy_from_slice(b"CHLD");
        storage.flush().unwrap();
    }

    #[test]
    fn test_second_process_sees_writes() {
        let path = temp_path("process");
        let mut storage = MappedStorage::create(path.clone(), 4096, None).unwrap();
        storage.as_mut_slice()[..4].copy_from_slice(b"FUSN");

        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "memory::storage::tests::test_child_writes_through_opened_mapping",
                "--test-threads=1",
            ])
            .env(CHILD_PATH_VAR, &path)
            .status()
            .unwrap();
        assert!(status.success());

        assert_eq!(&storage.as_slice()[4..8], b"CHLD");
        drop(storage);
        assert!(!path.exists());
    }

    #[test]
    fn test_discard_zeroes_range() {
        let mut storage = HeapStorage::new(32).unwrap();
        storage.as_mut_slice().fill(0xAA);
        storage.discard(8, 8);
        assert!(storage.as_slice()[8..16].iter().all(|&b| b == 0));
        assert_eq!(storage.as_slice()[16], 0xAA);
    }
}
