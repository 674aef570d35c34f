//! Direct-I/O-capable temporary file handle.
//!
//! Bucket files are opened with `O_DIRECT` when unbuffered I/O is requested
//! and the filesystem supports it; otherwise the handle silently falls back
//! to buffered I/O while the caller keeps the block-aligned write contract,
//! so on-disk layout is identical either way. Block size is discovered from
//! the file's device unless the configuration overrides it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

use crate::params::DEFAULT_BLOCK_SIZE;

/// Seek origin for queue seek commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekOrigin {
    /// From the beginning of the file.
    Start,
    /// From the current position.
    Current,
    /// From the end of the file.
    End,
}

/// An open temporary file.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    block_size: usize,
    direct: bool,
}

impl FileStream {
    /// Creates (truncating) a temporary file.
    ///
    /// `direct` requests `O_DIRECT`; if the filesystem refuses, the stream
    /// falls back to buffered I/O and reports `is_direct() == false`.
    pub fn create(path: &Path, direct: bool, block_size_override: Option<usize>) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);

        #[cfg(target_os = "linux")]
        let file = if direct {
            let mut direct_options = options.clone();
            direct_options.custom_flags(libc::O_DIRECT);
            match direct_options.open(path) {
                Ok(file) => Some(file),
                Err(_) => None,
            }
        } else {
            None
        };
        #[cfg(not(target_os = "linux"))]
        let file: Option<File> = None;

        let (file, effective_direct) = match file {
            Some(file) => (file, true),
            None => (options.open(path)?, false),
        };

        let block_size = match block_size_override {
            Some(size) => size,
            None => Self::discover_block_size(&file),
        };

        advise_sequential(&file);

        Ok(Self {
            file,
            block_size,
            direct: direct && effective_direct,
        })
    }

    #[cfg(unix)]
    fn discover_block_size(file: &File) -> usize {
        file.metadata()
            .map(|meta| meta.blksize() as usize)
            .ok()
            .filter(|&size| size >= 512 && size.is_power_of_two())
            .unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    #[cfg(not(unix))]
    fn discover_block_size(_file: &File) -> usize {
        DEFAULT_BLOCK_SIZE
    }

    /// Device block size for this file.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether `O_DIRECT` is actually in effect.
    #[inline]
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.direct
    }

    /// Writes the whole buffer, retrying short writes.
    pub fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let written = self.file.write(buf)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "file write returned zero",
                ));
            }
            buf = &buf[written..];
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes, retrying short reads.
    pub fn read_exact(&mut self, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let read = self.file.read(buf)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file read returned zero",
                ));
            }
            buf = &mut buf[read..];
        }
        Ok(())
    }

    /// Seeks and returns the new position.
    pub fn seek(&mut self, offset: i64, origin: SeekOrigin) -> io::Result<u64> {
        let from = match origin {
            SeekOrigin::Start => SeekFrom::Start(offset as u64),
            SeekOrigin::Current => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        };
        self.file.seek(from)
    }

    /// Current file position.
    pub fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    /// File length in bytes.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Hints the OS that the file will be accessed sequentially. Advisory only;
/// failures are ignored.
#[cfg(target_os = "linux")]
fn advise_sequential(file: &File) {
    // SAFETY: fadvise on a valid descriptor with a zero range is always safe.
    unsafe {
        let _ = libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_sequential(_file: &File) {}
