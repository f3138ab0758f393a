//! Free-space queries against the staging volume.
//!
//! The accountant keeps no state of its own: every call asks the OS. A failed
//! query is an error, never an implicit "enough space".

use async_trait::async_trait;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("failed to query free space on {path}: {source}")]
    OsQueryFailed {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("free space query task failed: {0}")]
    Join(String),
}

/// Answers "how many bytes are free" for the staging volume.
#[async_trait]
pub trait SpaceProbe: Send + Sync {
    async fn free_bytes(&self) -> Result<u64, SpaceError>;
}

/// Probe backed by `statvfs` on the configured volume.
#[derive(Clone, Debug)]
pub struct VolumeSpace {
    volume: PathBuf,
}

impl VolumeSpace {
    pub fn new(volume: impl Into<PathBuf>) -> Self {
        Self {
            volume: volume.into(),
        }
    }
}

#[async_trait]
impl SpaceProbe for VolumeSpace {
    async fn free_bytes(&self) -> Result<u64, SpaceError> {
        let volume = self.volume.clone();
        tokio::task::spawn_blocking(move || {
            available_space(&volume).map_err(|source| SpaceError::OsQueryFailed {
                path: volume.display().to_string(),
                source,
            })
        })
        .await
        .map_err(|err| SpaceError::Join(err.to_string()))?
    }
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_space(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: c_path is a valid NUL-terminated string, stat is zero-initialised
    // and only read after statvfs reports success.
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space query is only implemented for unix",
    ))
}

/// Total size in bytes of a directory tree, including the directory entries
/// themselves. A plain file returns its own length.
pub fn path_size(source: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(source)?;
    let mut total = meta.len();
    if meta.is_dir() {
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                total += path_size(&entry.path())?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}
