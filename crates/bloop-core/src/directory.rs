//! Service directory: where attached devices are published so the CLI
//! helper can discover the device created for its pid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Published record for one attached device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Driver instance name, e.g. `bloop0`.
    pub device: String,
    /// Helper process id, the discovery key.
    pub pid: i32,
    pub total_blocks: u64,
    pub read_only: bool,
}

/// Registry the driver publishes into on attach and withdraws from on
/// terminate.
pub trait ServiceDirectory: Send + Sync {
    fn publish(&self, record: &DeviceRecord) -> Result<()>;
    fn unpublish(&self, device: &str) -> Result<()>;
}

/// Filesystem-backed directory: one JSON file per device under a state
/// directory, written atomically via a tmp file + rename.
#[derive(Clone, Debug)]
pub struct FsDirectory {
    dir: PathBuf,
}

impl FsDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, device: &str) -> PathBuf {
        self.dir.join(format!("{device}.json"))
    }

    /// Scan the directory for the record published for `pid`, if any.
    pub fn find_by_pid(&self, pid: i32) -> Result<Option<DeviceRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read service directory"),
        };
        for entry in entries {
            let entry = entry.context("read directory entry")?;
            if entry.path().extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let data = fs::read(entry.path())
                .with_context(|| format!("read {}", entry.path().display()))?;
            let record: DeviceRecord = match serde_json::from_slice(&data) {
                Ok(record) => record,
                // A half-written or foreign file is not ours to fail on.
                Err(_) => continue,
            };
            if record.pid == pid {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

impl ServiceDirectory for FsDirectory {
    fn publish(&self, record: &DeviceRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).context("create service directory")?;
        let payload = serde_json::to_vec(record).context("encode device record")?;
        let path = self.record_path(&record.device);
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp_path)
                .with_context(|| format!("open {}", tmp_path.display()))?;
            file.write_all(&payload)
                .with_context(|| format!("write {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("flush {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("commit device record to {}", path.display()))?;
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .context("sync service directory")?;
        Ok(())
    }

    fn unpublish(&self, device: &str) -> Result<()> {
        let path = self.record_path(device);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(device: &str, pid: i32) -> DeviceRecord {
        DeviceRecord {
            device: device.into(),
            pid,
            total_blocks: 2048,
            read_only: false,
        }
    }

    #[test]
    fn publish_find_unpublish() {
        let dir = tempdir().unwrap();
        let directory = FsDirectory::new(dir.path());

        assert!(directory.find_by_pid(7).unwrap().is_none());

        directory.publish(&record("bloop0", 7)).unwrap();
        directory.publish(&record("bloop1", 8)).unwrap();
        let found = directory.find_by_pid(7).unwrap().unwrap();
        assert_eq!(found.device, "bloop0");

        directory.unpublish("bloop0").unwrap();
        assert!(directory.find_by_pid(7).unwrap().is_none());
        assert!(directory.find_by_pid(8).unwrap().is_some());
    }

    #[test]
    fn unpublish_is_idempotent() {
        let dir = tempdir().unwrap();
        let directory = FsDirectory::new(dir.path());
        directory.unpublish("never-published").unwrap();
    }

    #[test]
    fn republish_overwrites() {
        let dir = tempdir().unwrap();
        let directory = FsDirectory::new(dir.path());
        directory.publish(&record("bloop0", 7)).unwrap();
        directory.publish(&record("bloop0", 9)).unwrap();
        assert!(directory.find_by_pid(7).unwrap().is_none());
        assert_eq!(directory.find_by_pid(9).unwrap().unwrap().device, "bloop0");
    }
}
