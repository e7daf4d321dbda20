use std::{collections::HashMap, sync::Arc, time::Duration};

use aikore_instance::InstanceId;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::error::{InstanceError, Result};

/// Handle to a spawned process group leader.
///
/// The exit flag is driven by the task that reaps the child, so a pid that
/// has been waited on is never reported as alive.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    pub fn new(pid: u32, exited: watch::Receiver<bool>) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            exited,
        }
    }

    pub fn pgid(&self) -> i32 {
        self.pid as i32
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Waits until the process is reaped. Returns `false` on timeout.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exited.clone();
        tokio::time::timeout(timeout, rx.wait_for(|exited| *exited))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Background status watcher of one instance.
#[derive(Debug)]
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the watcher and waits for its loop to return.
    pub async fn cancel_and_wait(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Waits for the watcher to finish on its own.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(error = %e, "status watcher panicked");
            }
        }
    }
}

#[derive(Debug)]
pub struct RegistryEntry {
    pub process: ProcessHandle,
    pub watcher: WatcherHandle,
    /// Ports held by this run (application and bridge).
    pub ports: Vec<u16>,
}

#[derive(Debug)]
enum Slot {
    /// Start accepted, process not spawned yet.
    Launching,
    Running(RegistryEntry),
}

/// Instances currently supervised by this process.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<InstanceId, Slot>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the id for a start attempt. Fails if any slot exists for it.
    pub async fn reserve(&self, id: &InstanceId) -> Result<()> {
        let mut map = self.inner.lock().await;
        if map.contains_key(id) {
            return Err(InstanceError::AlreadyRunning(id.clone()));
        }
        map.insert(id.clone(), Slot::Launching);
        Ok(())
    }

    /// Fills a reserved slot with the running entry.
    ///
    /// Inserting over a running entry is rejected.
    pub async fn activate(&self, id: &InstanceId, entry: RegistryEntry) -> Result<()> {
        let mut map = self.inner.lock().await;
        if let Some(Slot::Running(_)) = map.get(id) {
            return Err(InstanceError::AlreadyRunning(id.clone()));
        }
        map.insert(id.clone(), Slot::Running(entry));
        Ok(())
    }

    /// Drops a reservation that never reached `activate`.
    pub async fn release(&self, id: &InstanceId) {
        let mut map = self.inner.lock().await;
        if let Some(Slot::Launching) = map.get(id) {
            map.remove(id);
        }
    }

    pub async fn contains(&self, id: &InstanceId) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    pub async fn is_launching(&self, id: &InstanceId) -> bool {
        matches!(self.inner.lock().await.get(id), Some(Slot::Launching))
    }

    pub async fn process(&self, id: &InstanceId) -> Option<ProcessHandle> {
        match self.inner.lock().await.get(id) {
            Some(Slot::Running(e)) => Some(e.process.clone()),
            _ => None,
        }
    }

    /// Removes and returns the running entry.
    pub async fn remove(&self, id: &InstanceId) -> Option<RegistryEntry> {
        let mut map = self.inner.lock().await;
        match map.get(id) {
            Some(Slot::Running(_)) => match map.remove(id) {
                Some(Slot::Running(e)) => Some(e),
                _ => None,
            },
            _ => None,
        }
    }

    /// Ports held by running entries, optionally ignoring one instance.
    pub async fn claimed_ports(&self, exclude: Option<&InstanceId>) -> Vec<u16> {
        let map = self.inner.lock().await;
        map.iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .filter_map(|(_, slot)| match slot {
                Slot::Running(e) => Some(e.ports.iter().copied()),
                Slot::Launching => None,
            })
            .flatten()
            .collect()
    }

    pub async fn ids(&self) -> Vec<InstanceId> {
        self.inner.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: u32, ports: Vec<u16>) -> (RegistryEntry, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let join = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        });
        (
            RegistryEntry {
                process: ProcessHandle::new(pid, rx),
                watcher: WatcherHandle::new(cancel, join),
                ports,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn reserve_guards_duplicate_start() {
        let reg = Registry::new();
        let id = InstanceId::from("a");
        reg.reserve(&id).await.unwrap();
        assert!(matches!(
            reg.reserve(&id).await,
            Err(InstanceError::AlreadyRunning(_))
        ));

        let (e, _tx) = entry(10, vec![19001]);
        reg.activate(&id, e).await.unwrap();
        assert!(matches!(
            reg.reserve(&id).await,
            Err(InstanceError::AlreadyRunning(_))
        ));

        let (dup, _tx2) = entry(11, vec![]);
        assert!(matches!(
            reg.activate(&id, dup).await,
            Err(InstanceError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn release_only_drops_reservations() {
        let reg = Registry::new();
        let id = InstanceId::from("a");
        reg.reserve(&id).await.unwrap();
        reg.release(&id).await;
        assert!(!reg.contains(&id).await);

        reg.reserve(&id).await.unwrap();
        let (e, _tx) = entry(10, vec![]);
        reg.activate(&id, e).await.unwrap();
        reg.release(&id).await;
        assert!(reg.contains(&id).await);
    }

    #[tokio::test]
    async fn claimed_ports_scans_running_entries() {
        let reg = Registry::new();
        for (name, pid, ports) in [("a", 1, vec![19001, 40000]), ("b", 2, vec![19002])] {
            let id = InstanceId::from(name);
            reg.reserve(&id).await.unwrap();
            let (e, _tx) = entry(pid, ports);
            reg.activate(&id, e).await.unwrap();
        }
        reg.reserve(&InstanceId::from("c")).await.unwrap();

        let mut all = reg.claimed_ports(None).await;
        all.sort_unstable();
        assert_eq!(all, vec![19001, 19002, 40000]);

        let others = reg.claimed_ports(Some(&InstanceId::from("a"))).await;
        assert_eq!(others, vec![19002]);
    }

    #[tokio::test]
    async fn process_handle_tracks_exit() {
        let (tx, rx) = watch::channel(false);
        let handle = ProcessHandle::new(42, rx);
        assert!(!handle.has_exited());
        assert!(!handle.wait_exit(Duration::from_millis(10)).await);
        tx.send(true).unwrap();
        assert!(handle.has_exited());
        assert!(handle.wait_exit(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn remove_returns_entry_once() {
        let reg = Registry::new();
        let id = InstanceId::from("a");
        reg.reserve(&id).await.unwrap();
        let (e, _tx) = entry(7, vec![]);
        reg.activate(&id, e).await.unwrap();

        let removed = reg.remove(&id).await.unwrap();
        assert_eq!(removed.process.pid, 7);
        removed.watcher.cancel_and_wait().await;
        assert!(reg.remove(&id).await.is_none());
    }
}
