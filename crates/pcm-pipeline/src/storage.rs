//! Storage driver contract and backends.
//!
//! The pipeline reads files through a narrow capability interface:
//! - [`StorageDriver`] owns the device/filesystem resources
//! - [`FileHandle`] is a non-owning token bound to one open file
//!
//! Two backends ship with the crate: [`DirStorage`] maps filenames onto a host
//! directory, [`MemStorage`] serves in-memory images for tests and simulation.
//! At most one file may be open per driver; the second `open_file` fails with a
//! distinct error instead of silently replacing the first.

use std::collections::HashMap;
use std::fs;
use std::io::{Read as _, Seek as _, SeekFrom};
use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by the storage layer.
///
/// Controller init and filesystem mount failures stay distinct: the former is
/// usually an integration bug, the latter a missing or corrupt medium.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage driver is not open")]
    Uninitialized,
    #[error("storage init failed: {0}")]
    InitFailed(String),
    #[error("filesystem mount failed: {0}")]
    MountFailed(String),
    #[error("unable to open file {name:?}: {reason}")]
    OpenFile { name: String, reason: String },
    #[error("a file is already open on this driver")]
    FileAlreadyOpen,
    #[error("file handle is closed or stale")]
    HandleClosed,
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("seek failed: {0}")]
    SeekFailed(String),
    #[error("close failed: {0}")]
    CloseFailed(String),
}

/// Device geometry snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub block_size: u32,
    pub num_blocks: u32,
    /// Always `block_size * num_blocks`; see [`DeviceInfo::from_geometry`].
    pub total_bytes: u64,
}

impl DeviceInfo {
    /// Capacity is derived from geometry so every caller estimating free
    /// space uses the same rule.
    pub fn from_geometry(block_size: u32, num_blocks: u32) -> Self {
        Self {
            block_size,
            num_blocks,
            total_bytes: u64::from(block_size) * u64::from(num_blocks),
        }
    }
}

/// Non-owning token for one open file.
///
/// The driver that issued the handle owns the underlying resource; every
/// operation takes the handle alongside the driver. Once closed, the token is
/// invalidated and any further use is rejected with
/// [`StorageError::HandleClosed`] rather than touching stale state.
#[derive(Debug)]
pub struct FileHandle {
    id: u32,
    name: String,
    open: bool,
}

impl FileHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Capability interface over a mounted filesystem.
///
/// `read` copies up to `buf.len()` bytes at the handle's implicit position and
/// advances it; a short count signals end-of-file, never garbage. `seek` and
/// `file_len` back the codec's offset-addressed decode and its declared-size
/// cross-check.
pub trait StorageDriver {
    fn open(&mut self) -> Result<(), StorageError>;
    fn close(&mut self) -> Result<(), StorageError>;
    fn open_file(&mut self, name: &str) -> Result<FileHandle, StorageError>;
    fn close_file(&mut self, handle: &mut FileHandle) -> Result<(), StorageError>;
    fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize, StorageError>;
    fn seek(&mut self, handle: &mut FileHandle, pos: u64) -> Result<(), StorageError>;
    fn file_len(&mut self, handle: &FileHandle) -> Result<u64, StorageError>;
    fn info(&self) -> Result<DeviceInfo, StorageError>;
}

const DEFAULT_BLOCK_SIZE: u32 = 512;
const DEFAULT_NUM_BLOCKS: u32 = 262_144; // 128 MiB stand-in card

/// Host-directory backend: filenames resolve against a root directory.
///
/// This is the concrete backend for host builds; the memory-card controller
/// backend is vendor glue and lives outside this crate. Geometry is a
/// configurable stand-in since a host directory has none of its own.
pub struct DirStorage {
    root: PathBuf,
    block_size: u32,
    num_blocks: u32,
    state: Option<DirState>,
}

struct DirState {
    current: Option<DirOpenFile>,
    next_id: u32,
}

struct DirOpenFile {
    id: u32,
    file: fs::File,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: DEFAULT_NUM_BLOCKS,
            state: None,
        }
    }

    pub fn with_geometry(mut self, block_size: u32, num_blocks: u32) -> Self {
        self.block_size = block_size;
        self.num_blocks = num_blocks;
        self
    }

    fn state_mut(&mut self) -> Result<&mut DirState, StorageError> {
        self.state.as_mut().ok_or(StorageError::Uninitialized)
    }

    fn current_mut<'a>(
        state: &'a mut DirState,
        handle: &FileHandle,
    ) -> Result<&'a mut DirOpenFile, StorageError> {
        if !handle.open {
            return Err(StorageError::HandleClosed);
        }
        match state.current.as_mut() {
            Some(f) if f.id == handle.id => Ok(f),
            _ => Err(StorageError::HandleClosed),
        }
    }
}

impl StorageDriver for DirStorage {
    fn open(&mut self) -> Result<(), StorageError> {
        if self.state.is_some() {
            return Err(StorageError::InitFailed("driver already open".into()));
        }
        let meta = fs::metadata(&self.root)
            .map_err(|e| StorageError::MountFailed(format!("{}: {e}", self.root.display())))?;
        if !meta.is_dir() {
            return Err(StorageError::MountFailed(format!(
                "{}: not a directory",
                self.root.display()
            )));
        }
        self.state = Some(DirState {
            current: None,
            next_id: 1,
        });
        tracing::debug!(root = %self.root.display(), "storage open");
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let state = self.state.as_ref().ok_or(StorageError::Uninitialized)?;
        if state.current.is_some() {
            return Err(StorageError::CloseFailed("a file is still open".into()));
        }
        self.state = None;
        Ok(())
    }

    fn open_file(&mut self, name: &str) -> Result<FileHandle, StorageError> {
        let root = self.root.clone();
        let state = self.state_mut()?;
        if state.current.is_some() {
            return Err(StorageError::FileAlreadyOpen);
        }
        let file = fs::File::open(root.join(name)).map_err(|e| StorageError::OpenFile {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let id = state.next_id;
        state.next_id += 1;
        state.current = Some(DirOpenFile { id, file });
        Ok(FileHandle {
            id,
            name: name.to_string(),
            open: true,
        })
    }

    fn close_file(&mut self, handle: &mut FileHandle) -> Result<(), StorageError> {
        let state = self.state_mut()?;
        Self::current_mut(state, handle)?;
        state.current = None;
        handle.open = false;
        Ok(())
    }

    fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize, StorageError> {
        let state = self.state_mut()?;
        let open = Self::current_mut(state, handle)?;
        let mut filled = 0;
        while filled < buf.len() {
            match open.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(StorageError::ReadFailed(e.to_string())),
            }
        }
        Ok(filled)
    }

    fn seek(&mut self, handle: &mut FileHandle, pos: u64) -> Result<(), StorageError> {
        let state = self.state_mut()?;
        let open = Self::current_mut(state, handle)?;
        open.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| StorageError::SeekFailed(e.to_string()))?;
        Ok(())
    }

    fn file_len(&mut self, handle: &FileHandle) -> Result<u64, StorageError> {
        let state = self.state_mut()?;
        let open = Self::current_mut(state, handle)?;
        let meta = open
            .file
            .metadata()
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        Ok(meta.len())
    }

    fn info(&self) -> Result<DeviceInfo, StorageError> {
        if self.state.is_none() {
            return Err(StorageError::Uninitialized);
        }
        Ok(DeviceInfo::from_geometry(self.block_size, self.num_blocks))
    }
}

/// In-memory backend serving named byte images.
///
/// The simulation/test counterpart of [`DirStorage`]; same contract, no I/O.
#[derive(Default)]
pub struct MemStorage {
    files: HashMap<String, Vec<u8>>,
    open: bool,
    session: Option<MemOpenFile>,
    next_id: u32,
}

struct MemOpenFile {
    id: u32,
    name: String,
    pos: u64,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Register a named image before (or after) opening the driver.
    pub fn insert_file(&mut self, name: &str, bytes: Vec<u8>) {
        self.files.insert(name.to_string(), bytes);
    }

    /// Whether any file handle is currently outstanding.
    pub fn has_open_file(&self) -> bool {
        self.session.is_some()
    }

    fn session_mut(&mut self, handle: &FileHandle) -> Result<&mut MemOpenFile, StorageError> {
        if !self.open {
            return Err(StorageError::Uninitialized);
        }
        if !handle.open {
            return Err(StorageError::HandleClosed);
        }
        match self.session.as_mut() {
            Some(s) if s.id == handle.id => Ok(s),
            _ => Err(StorageError::HandleClosed),
        }
    }
}

impl StorageDriver for MemStorage {
    fn open(&mut self) -> Result<(), StorageError> {
        if self.open {
            return Err(StorageError::InitFailed("driver already open".into()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if !self.open {
            return Err(StorageError::Uninitialized);
        }
        if self.session.is_some() {
            return Err(StorageError::CloseFailed("a file is still open".into()));
        }
        self.open = false;
        Ok(())
    }

    fn open_file(&mut self, name: &str) -> Result<FileHandle, StorageError> {
        if !self.open {
            return Err(StorageError::Uninitialized);
        }
        if self.session.is_some() {
            return Err(StorageError::FileAlreadyOpen);
        }
        if !self.files.contains_key(name) {
            return Err(StorageError::OpenFile {
                name: name.to_string(),
                reason: "no such file".into(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.session = Some(MemOpenFile {
            id,
            name: name.to_string(),
            pos: 0,
        });
        Ok(FileHandle {
            id,
            name: name.to_string(),
            open: true,
        })
    }

    fn close_file(&mut self, handle: &mut FileHandle) -> Result<(), StorageError> {
        self.session_mut(handle)?;
        self.session = None;
        handle.open = false;
        Ok(())
    }

    fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize, StorageError> {
        if !self.open {
            return Err(StorageError::Uninitialized);
        }
        if !handle.open {
            return Err(StorageError::HandleClosed);
        }
        let session = match self.session.as_mut() {
            Some(s) if s.id == handle.id => s,
            _ => return Err(StorageError::HandleClosed),
        };
        let bytes = self
            .files
            .get(&session.name)
            .ok_or_else(|| StorageError::ReadFailed("image removed".into()))?;
        let start = (session.pos.min(bytes.len() as u64)) as usize;
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        session.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, handle: &mut FileHandle, pos: u64) -> Result<(), StorageError> {
        let session = self.session_mut(handle)?;
        session.pos = pos;
        Ok(())
    }

    fn file_len(&mut self, handle: &FileHandle) -> Result<u64, StorageError> {
        if !self.open {
            return Err(StorageError::Uninitialized);
        }
        if !handle.open {
            return Err(StorageError::HandleClosed);
        }
        self.files
            .get(&handle.name)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StorageError::ReadFailed("image removed".into()))
    }

    fn info(&self) -> Result<DeviceInfo, StorageError> {
        if !self.open {
            return Err(StorageError::Uninitialized);
        }
        let total: u64 = self.files.values().map(|b| b.len() as u64).sum();
        let num_blocks = total.div_ceil(u64::from(DEFAULT_BLOCK_SIZE)) as u32;
        Ok(DeviceInfo::from_geometry(DEFAULT_BLOCK_SIZE, num_blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened_mem(files: &[(&str, Vec<u8>)]) -> MemStorage {
        let mut storage = MemStorage::new();
        for (name, bytes) in files {
            storage.insert_file(name, bytes.clone());
        }
        storage.open().unwrap();
        storage
    }

    #[test]
    fn close_before_open_is_uninitialized() {
        let mut storage = MemStorage::new();
        assert!(matches!(
            storage.close(),
            Err(StorageError::Uninitialized)
        ));
    }

    #[test]
    fn open_file_requires_open_driver() {
        let mut storage = MemStorage::new();
        storage.insert_file("a.wav", vec![1, 2, 3]);
        assert!(matches!(
            storage.open_file("a.wav"),
            Err(StorageError::Uninitialized)
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let mut storage = opened_mem(&[]);
        assert!(matches!(
            storage.open_file("nope.wav"),
            Err(StorageError::OpenFile { .. })
        ));
    }

    #[test]
    fn second_open_file_fails_distinctly() {
        let mut storage = opened_mem(&[("a.wav", vec![0; 4]), ("b.wav", vec![0; 4])]);
        let mut first = storage.open_file("a.wav").unwrap();
        assert!(matches!(
            storage.open_file("b.wav"),
            Err(StorageError::FileAlreadyOpen)
        ));
        storage.close_file(&mut first).unwrap();
        let mut second = storage.open_file("b.wav").unwrap();
        storage.close_file(&mut second).unwrap();
    }

    #[test]
    fn close_with_open_file_is_a_close_failure() {
        let mut storage = opened_mem(&[("a.bin", vec![1, 2, 3])]);
        let mut handle = storage.open_file("a.bin").unwrap();

        assert!(matches!(
            storage.close(),
            Err(StorageError::CloseFailed(_))
        ));
        // The driver is still usable; close the file and retry.
        storage.close_file(&mut handle).unwrap();
        storage.close().unwrap();
    }

    #[test]
    fn read_advances_and_reports_short_reads() {
        let mut storage = opened_mem(&[("a.bin", vec![1, 2, 3, 4, 5])]);
        let mut handle = storage.open_file("a.bin").unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(storage.read(&mut handle, &mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);

        let mut rest = [0u8; 8];
        assert_eq!(storage.read(&mut handle, &mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], &[4, 5]);

        assert_eq!(storage.read(&mut handle, &mut rest).unwrap(), 0);
    }

    #[test]
    fn stale_handle_is_rejected_not_reused() {
        let mut storage = opened_mem(&[("a.bin", vec![1, 2, 3])]);
        let mut handle = storage.open_file("a.bin").unwrap();
        storage.close_file(&mut handle).unwrap();
        assert!(!handle.is_open());

        let mut buf = [0u8; 1];
        assert!(matches!(
            storage.read(&mut handle, &mut buf),
            Err(StorageError::HandleClosed)
        ));
        assert!(matches!(
            storage.close_file(&mut handle),
            Err(StorageError::HandleClosed)
        ));
    }

    #[test]
    fn seek_repositions_reads() {
        let mut storage = opened_mem(&[("a.bin", vec![10, 11, 12, 13])]);
        let mut handle = storage.open_file("a.bin").unwrap();
        storage.seek(&mut handle, 2).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(storage.read(&mut handle, &mut buf).unwrap(), 2);
        assert_eq!(buf, [12, 13]);
    }

    #[test]
    fn info_derives_capacity_from_geometry() {
        let info = DeviceInfo::from_geometry(512, 4);
        assert_eq!(info.total_bytes, 2048);

        let storage = opened_mem(&[("a.bin", vec![0; 600])]);
        let info = storage.info().unwrap();
        assert_eq!(info.block_size, 512);
        assert_eq!(info.num_blocks, 2);
        assert_eq!(info.total_bytes, 1024);
    }

    #[test]
    fn dir_storage_reads_a_real_file() {
        let root = std::env::temp_dir().join(format!("pcm-pipeline-test-{}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("clip.bin"), [9u8, 8, 7, 6]).unwrap();

        let mut storage = DirStorage::new(&root).with_geometry(512, 8);
        storage.open().unwrap();
        assert_eq!(storage.info().unwrap().total_bytes, 4096);

        let mut handle = storage.open_file("clip.bin").unwrap();
        assert_eq!(storage.file_len(&handle).unwrap(), 4);
        storage.seek(&mut handle, 1).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(storage.read(&mut handle, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[8, 7, 6]);

        storage.close_file(&mut handle).unwrap();
        storage.close().unwrap();
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn dir_storage_mount_failure_is_distinct() {
        let mut storage = DirStorage::new("/definitely/not/a/real/root");
        assert!(matches!(storage.open(), Err(StorageError::MountFailed(_))));
    }
}
