use anyhow::{Context, Result};
use std::{
    io,
    os::unix::fs::FileExt,
    path::Path,
    sync::Arc,
};
use tokio::{fs::OpenOptions, task};
use tracing::debug;

use bloop_proto::BLOCK_SIZE;

/// Regular file serving as the media behind a loop device.
///
/// Positioned reads and writes run on the blocking pool and loop until
/// the full transfer lands; a short count mid-file surfaces as an error
/// rather than a partial transfer.
pub struct BackingFile {
    file: Arc<std::fs::File>,
    len: u64,
    writable: bool,
}

impl BackingFile {
    /// Open `path` read-only regardless of what the file would permit.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_display = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .with_context(|| format!("open {path_display} read-only"))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("stat {path_display}"))?
            .len();
        debug!(path = %path_display, len, "opened backing file read-only");
        Ok(Self {
            file: Arc::new(file.into_std().await),
            len,
            writable: false,
        })
    }

    /// Open `path` read-write, falling back to read-only when the file or
    /// filesystem refuses write access.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_display = path.display().to_string();
        let rw_result = OpenOptions::new().read(true).write(true).open(path).await;

        let (file, writable) = match rw_result {
            Ok(file) => (file, true),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
                ) =>
            {
                let file = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .await
                    .with_context(|| format!("open {path_display} read-only"))?;
                debug!(path = %path_display, "opened backing file read-only");
                (file, false)
            }
            Err(err) => return Err(err).context(format!("open {path_display}")),
        };

        let len = file
            .metadata()
            .await
            .with_context(|| format!("stat {path_display}"))?
            .len();
        if writable {
            debug!(path = %path_display, len, "opened backing file read-write");
        }

        Ok(Self {
            file: Arc::new(file.into_std().await),
            len,
            writable,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whole blocks the file can hold; a trailing partial block is not
    /// addressable and gets dropped from the count.
    pub fn total_blocks(&self) -> u64 {
        self.len / BLOCK_SIZE as u64
    }

    /// Fill `buf` from the file starting at byte `offset`.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        let len = buf.len();
        let tmp = task::spawn_blocking(move || {
            let mut tmp = vec![0u8; len];
            let mut read = 0;
            while read < len {
                let n = file.read_at(&mut tmp[read..], offset + read as u64)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "short read from backing file",
                    ));
                }
                read += n;
            }
            Ok::<_, io::Error>(tmp)
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))??;
        buf.copy_from_slice(&tmp);
        Ok(())
    }

    /// Write `buf` to the file starting at byte `offset`.
    pub async fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backing file opened read-only",
            ));
        }

        let file = Arc::clone(&self.file);
        let data = buf.to_vec();
        let len = data.len();
        task::spawn_blocking(move || {
            let mut written = 0;
            while written < len {
                let n = file.write_at(&data[written..], offset + written as u64)?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write to backing file",
                    ));
                }
                written += n;
            }
            Ok(())
        })
        .await
        .unwrap_or_else(|err| Err(io::Error::other(err.to_string())))
    }

    pub async fn flush(&self) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        task::spawn_blocking(move || file.sync_data())
            .await
            .unwrap_or_else(|err| Err(io::Error::other(format!("flush join error: {err}"))))
    }
}
