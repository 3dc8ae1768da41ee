//! Persisted log positions.
//!
//! A checkpoint is a single little-endian `u64` in its own file, rewritten
//! and fsynced on every advance. Values never move backwards except through
//! [`Checkpoint::reset`], which only recovery uses.
//!
//! Every advance is also published on a `watch` channel so the chaser can
//! follow the writer and callers can wait for read-your-writes.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use chronicle_core::error::{Error, Result};

pub const WRITER_CHECKPOINT_FILE: &str = "writer.chk";
pub const CHASER_CHECKPOINT_FILE: &str = "chaser.chk";

pub struct Checkpoint {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
    value: AtomicU64,
    notify: watch::Sender<u64>,
}

impl Checkpoint {
    /// Open the checkpoint file, creating it at zero when absent.
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let name = name.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut buf = [0u8; 8];
        let len = file.metadata()?.len();
        let value = if len >= 8 {
            file.read_exact_at(&mut buf, 0)?;
            u64::from_le_bytes(buf)
        } else {
            if len > 0 {
                warn!(checkpoint = %name, len, "Torn checkpoint file, starting from zero");
            }
            file.write_all_at(&0u64.to_le_bytes(), 0)?;
            file.set_len(8)?;
            file.sync_all()?;
            0
        };

        debug!(checkpoint = %name, value, "Checkpoint opened");
        let (notify, _) = watch::channel(value);
        Ok(Self {
            name,
            path,
            file: Mutex::new(file),
            value: AtomicU64::new(value),
            notify,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Advance to `value` and fsync. Writing the current value is a no-op.
    pub fn write(&self, value: u64) -> Result<()> {
        let file = self.file.lock();
        let current = self.value.load(Ordering::Acquire);
        if value < current {
            return Err(Error::Checkpoint {
                name: self.name.clone(),
                message: format!("cannot move backwards from {} to {}", current, value),
            });
        }
        if value == current {
            return Ok(());
        }

        Self::persist(&file, value)?;
        self.value.store(value, Ordering::Release);
        drop(file);

        self.notify.send_replace(value);
        Ok(())
    }

    /// Advance only if `value` is ahead of the current position.
    pub fn advance_to(&self, value: u64) -> Result<bool> {
        if value <= self.read() {
            return Ok(false);
        }
        self.write(value)?;
        Ok(true)
    }

    /// Overwrite the value unconditionally. Recovery only.
    pub fn reset(&self, value: u64) -> Result<()> {
        let file = self.file.lock();
        let previous = self.value.load(Ordering::Acquire);
        Self::persist(&file, value)?;
        self.value.store(value, Ordering::Release);
        drop(file);

        if previous != value {
            warn!(checkpoint = %self.name, previous, value, "Checkpoint reset");
        }
        self.notify.send_replace(value);
        Ok(())
    }

    fn persist(file: &File, value: u64) -> Result<()> {
        file.write_all_at(&value.to_le_bytes(), 0)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    /// Wait until the checkpoint reaches at least `position`.
    pub async fn wait_for(&self, position: u64) {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow_and_update() >= position {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("name", &self.name)
            .field("value", &self.read())
            .finish()
    }
}
