//! File-backed snapshot storage.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::CoreConfig,
    error::Result,
    gpio::Gpio,
    state::{Snapshot, State},
};

#[derive(Clone)]
pub struct StateStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been stored yet.
    pub async fn load(&self) -> Result<Option<Snapshot>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) => Ok(Some(Snapshot::decode(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Loads and links the stored snapshot. A missing file yields an empty
    /// state; anything unreadable, corrupt or dangling is an error and
    /// nothing is returned.
    pub async fn load_state(&self, gpio: Arc<dyn Gpio>, config: &CoreConfig) -> Result<State> {
        let Some(snapshot) = self.load().await? else {
            info!(path = %self.path.display(), "no stored state, starting empty");
            return Ok(State::new(gpio, config));
        };

        let state = State::from_snapshot(&snapshot, gpio, config)?;
        info!(
            path = %self.path.display(),
            devices = state.devices.len(),
            programs = state.programs.len(),
            schedules = state.schedules.len(),
            "state loaded"
        );
        Ok(state)
    }

    /// Writes to a sibling temp file first so a crash never leaves a torn file.
    pub async fn store(&self, snapshot: &Snapshot) -> Result<()> {
        let payload = snapshot.encode()?;
        let _guard = self.lock.lock().await;
        let path = self.path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    /// Moves a rejected state file out of the way so the next store does not
    /// overwrite it.
    pub async fn quarantine(&self) -> Result<PathBuf> {
        let _guard = self.lock.lock().await;
        let target = self.path.with_extension("json.rejected");
        tokio::fs::rename(self.path.as_ref(), &target).await?;
        Ok(target)
    }
}

/// Stores every snapshot published on `changes`, coalescing bursts that
/// arrive within `debounce`. Exits once the publishing side is gone.
pub fn spawn_writer(
    store: StateStore,
    mut changes: watch::Receiver<Snapshot>,
    debounce: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            tokio::time::sleep(debounce).await;
            let snapshot = changes.borrow_and_update().clone();
            match store.store(&snapshot).await {
                Ok(()) => debug!(path = %store.path().display(), "state stored"),
                Err(err) => warn!(path = %store.path().display(), error = %err, "failed to store state"),
            }
        }
    })
}
