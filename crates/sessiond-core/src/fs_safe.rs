//! Atomic, bounded file I/O for key and policy state.
//!
//! Every persisted artifact of the daemon (owner key, policy envelopes,
//! flag files) goes through these helpers:
//!
//! - [`atomic_write`]: temp file in the target directory, fsync, rename,
//!   fsync of the parent directory. A crash leaves either the old or the
//!   new complete file, never a torn one.
//! - [`bounded_read`]: size-capped read through a symlink-refusing open,
//!   so a corrupted or adversarial state file cannot exhaust memory and a
//!   planted symlink cannot redirect the daemon to foreign files.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;

/// Errors from the safe filesystem helpers.
#[derive(Debug, Error)]
pub enum FsError {
    /// File exceeds the caller's size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max}")]
    FileTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Configured cap in bytes.
        max: u64,
    },

    /// The path resolved to a symlink.
    #[error("refusing to open symlink at {}", path.display())]
    SymlinkRefused {
        /// Offending path.
        path: std::path::PathBuf,
    },

    /// The opened handle is not a regular file.
    #[error("not a regular file at {}", path.display())]
    NotRegularFile {
        /// Offending path.
        path: std::path::PathBuf,
    },

    /// The target path has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Offending path.
        path: std::path::PathBuf,
    },

    /// Underlying I/O failure.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: &'static str,
        /// Source error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Writes `data` to `path` via temp file + fsync + rename.
///
/// The parent directory is created with mode 0700 if missing, and is
/// fsynced after the rename so the directory entry is durable.
///
/// # Errors
///
/// Returns [`FsError`] if any filesystem step fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).ok_or(
        FsError::NoParentDirectory {
            path: path.to_path_buf(),
        },
    )?;
    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| FsError::io("write temp file", e))?;
    tmp.flush().map_err(|e| FsError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| FsError::io("rename to final path", e.error))?;

    let dir = File::open(parent).map_err(|e| FsError::io("open parent for fsync", e))?;
    dir.sync_all().map_err(|e| FsError::io("fsync parent", e))?;
    Ok(())
}

/// Reads at most `max_size` bytes from a regular file at `path`.
///
/// # Errors
///
/// - [`FsError::SymlinkRefused`] if the path is a symlink.
/// - [`FsError::NotRegularFile`] for FIFOs, devices, and directories.
/// - [`FsError::FileTooLarge`] if the file exceeds `max_size`, checked
///   both on handle metadata and again after the capped read.
pub fn bounded_read(path: &Path, max_size: u64) -> Result<Vec<u8>, FsError> {
    let file = open_regular(path)?;

    let size = file
        .metadata()
        .map_err(|e| FsError::io("fstat for size check", e))?
        .len();
    if size > max_size {
        return Err(FsError::FileTooLarge {
            size,
            max: max_size,
        });
    }

    let mut buf = Vec::with_capacity(usize::try_from(size.min(max_size)).unwrap_or(0));
    file.take(max_size.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| FsError::io("bounded read", e))?;
    // The file may have grown between fstat and read.
    if buf.len() as u64 > max_size {
        return Err(FsError::FileTooLarge {
            size: buf.len() as u64,
            max: max_size,
        });
    }
    Ok(buf)
}

/// Removes `path` if it exists; missing files are success.
///
/// # Errors
///
/// Returns [`FsError::Io`] on any failure other than `NotFound`.
pub fn remove_if_exists(path: &Path) -> Result<(), FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::io("remove file", e)),
    }
}

/// Opens `path` refusing symlinks, then verifies it is a regular file.
fn open_regular(path: &Path) -> Result<File, FsError> {
    let file = open_nofollow(path)?;
    let metadata = file
        .metadata()
        .map_err(|e| FsError::io("fstat after open", e))?;
    if !metadata.is_file() {
        return Err(FsError::NotRegularFile {
            path: path.to_path_buf(),
        });
    }
    Ok(file)
}

/// Linux open with `O_NOFOLLOW | O_NONBLOCK | O_CLOEXEC`.
///
/// `O_NONBLOCK` keeps a planted FIFO at a state-file path from stalling
/// the daemon; the regular-file check in [`open_regular`] rejects it
/// right after.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn open_nofollow(path: &Path) -> Result<File, FsError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::io::FromRawFd;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        FsError::io(
            "path contains null byte",
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "null byte in path"),
        )
    })?;

    // SAFETY: valid C string, well-defined flags; the fd is checked and
    // immediately wrapped in an owning File.
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ELOOP) {
            return Err(FsError::SymlinkRefused {
                path: path.to_path_buf(),
            });
        }
        return Err(FsError::io("open with O_NOFOLLOW", err));
    }
    // SAFETY: fd is a valid open descriptor; ownership moves to File.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn open_nofollow(path: &Path) -> Result<File, FsError> {
    let meta = fs::symlink_metadata(path).map_err(|e| FsError::io("symlink_metadata", e))?;
    if meta.file_type().is_symlink() {
        return Err(FsError::SymlinkRefused {
            path: path.to_path_buf(),
        });
    }
    File::open(path).map_err(|e| FsError::io("open file", e))
}

fn ensure_dir(dir: &Path) -> Result<(), FsError> {
    if dir.exists() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| FsError::io("create parent directory", e))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(|e| FsError::io("create parent directory", e))
    }
}
