use crate::ByteDevice;
use bfs_error::{BfsError, Result};
use bfs_types::ByteOffset;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn checked_range(offset: ByteOffset, len: usize, device_len: u64, op: &str) -> Result<u64> {
    let end = offset
        .0
        .checked_add(
            u64::try_from(len)
                .map_err(|_| BfsError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| BfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(BfsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(end)
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// A read-write open that the OS refuses falls back to read-only; callers
/// learn about the downgrade through [`ByteDevice::is_read_only`].
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|err| {
                tracing::debug!(
                    target: "bfs::block",
                    path = %path.display(),
                    error = %err,
                    "read_write_open_refused"
                );
                OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(BfsError::ReadOnlyDevice);
        }
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        !self.writable
    }
}

/// In-memory byte device.
///
/// Counts writes and syncs so callers can assert that an operation left the
/// image untouched.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    read_only: bool,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            read_only: false,
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn new_read_only(bytes: Vec<u8>) -> Self {
        Self {
            read_only: true,
            ..Self::from_bytes(bytes)
        }
    }

    /// Copy of the current device contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Number of successful `write_all_at` calls.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let device_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_range(offset, buf.len(), device_len, "read")?;
        let (start, end) = (offset.to_usize().map_err(parse_err)?, usize_end(end)?);
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BfsError::ReadOnlyDevice);
        }
        let mut bytes = self.bytes.lock();
        let device_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let end = checked_range(offset, buf.len(), device_len, "write")?;
        let (start, end) = (offset.to_usize().map_err(parse_err)?, usize_end(end)?);
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

fn parse_err(err: bfs_types::ParseError) -> BfsError {
    BfsError::Format(err.to_string())
}

fn usize_end(end: u64) -> Result<usize> {
    usize::try_from(end).map_err(|_| BfsError::Format("range end does not fit usize".to_owned()))
}
