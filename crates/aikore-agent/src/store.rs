//! Boundary to the persisted instance records.
//!
//! Records are created and deleted by the CRUD layer. The supervisor only
//! reads them and mutates status, pid and allocated resources.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use aikore_instance::{Instance, InstanceId, InstanceStatus};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::error::{InstanceError, Result};

/// Mutation applied atomically to one stored record.
///
/// Returns whether the record changed; unchanged records are not rewritten.
pub type Mutation = Box<dyn FnOnce(&mut Instance) -> Result<bool> + Send>;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: &InstanceId) -> Result<Instance>;

    async fn list(&self) -> Result<Vec<Instance>>;

    /// Applies `mutation` to the record under the store's write lock.
    /// If the mutation fails nothing is persisted.
    async fn update(&self, id: &InstanceId, mutation: Mutation) -> Result<(Instance, bool)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidUpdate {
    Keep,
    Set(u32),
    Clear,
}

/// Moves the record to `next`, enforcing the transition table.
pub async fn transition(
    store: &dyn InstanceStore,
    id: &InstanceId,
    next: InstanceStatus,
    pid: PidUpdate,
) -> Result<Instance> {
    let (inst, _) = store
        .update(
            id,
            Box::new(move |inst| {
                if !inst.status.can_transition_to(next) {
                    return Err(InstanceError::IllegalTransition {
                        from: inst.status,
                        to: next,
                    });
                }
                let before = (inst.status, inst.pid);
                inst.status = next;
                match pid {
                    PidUpdate::Keep => {}
                    PidUpdate::Set(p) => inst.pid = Some(p),
                    PidUpdate::Clear => inst.pid = None,
                }
                Ok(before != (inst.status, inst.pid))
            }),
        )
        .await?;
    Ok(inst)
}

/// Moves the record to `next` only if its current status is one of `expected`.
///
/// Returns `false` when the record was in another state and was left alone.
pub async fn compare_and_set_status(
    store: &dyn InstanceStore,
    id: &InstanceId,
    expected: &[InstanceStatus],
    next: InstanceStatus,
) -> Result<bool> {
    let expected = expected.to_vec();
    let (_, changed) = store
        .update(
            id,
            Box::new(move |inst| {
                if !expected.contains(&inst.status) || !inst.status.can_transition_to(next) {
                    return Ok(false);
                }
                inst.status = next;
                Ok(true)
            }),
        )
        .await?;
    Ok(changed)
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<InstanceId, Instance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, inst: Instance) {
        self.records.lock().await.insert(inst.id.clone(), inst);
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, id: &InstanceId) -> Result<Instance> {
        self.records
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| InstanceError::NotFound(id.clone()))
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn update(&self, id: &InstanceId, mutation: Mutation) -> Result<(Instance, bool)> {
        let mut map = self.records.lock().await;
        let current = map
            .get(id)
            .ok_or_else(|| InstanceError::NotFound(id.clone()))?;
        let mut next = current.clone();
        let changed = mutation(&mut next)?;
        if changed {
            map.insert(id.clone(), next.clone());
        }
        Ok((next, changed))
    }
}

/// One `<id>.json` file per record.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && id != "."
        && id != ".."
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, id: &InstanceId) -> Result<PathBuf> {
        // Keep ids safe for filesystem paths.
        if !is_safe_id(id.as_str()) {
            return Err(InstanceError::NotFound(id.clone()));
        }
        Ok(self.dir.join(format!("{}.json", id.as_str())))
    }

    async fn read(&self, id: &InstanceId) -> Result<Instance> {
        let path = self.record_path(id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InstanceError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice::<Instance>(&raw)?)
    }

    async fn write(&self, inst: &Instance) -> Result<()> {
        let path = self.record_path(&inst.id)?;
        write_json_atomic(&self.dir, &path, inst).await
    }

    /// Creates or replaces a record. The CRUD layer owns this in production.
    pub async fn insert(&self, inst: &Instance) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(inst).await
    }
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    dir: &Path,
    path: &Path,
    value: &T,
) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&data).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl InstanceStore for JsonFileStore {
    async fn get(&self, id: &InstanceId) -> Result<Instance> {
        self.read(id).await
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Instance>(&raw) {
                Ok(inst) => out.push(inst),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable instance record");
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn update(&self, id: &InstanceId, mutation: Mutation) -> Result<(Instance, bool)> {
        let _guard = self.write_lock.lock().await;
        let mut inst = self.read(id).await?;
        let changed = mutation(&mut inst)?;
        if changed {
            self.write(&inst).await?;
        }
        Ok((inst, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transition_rejects_illegal_moves() {
        let store = MemoryStore::new();
        let mut inst = Instance::new("a", "a.sh");
        inst.status = InstanceStatus::Started;
        let id = inst.id.clone();
        store.insert(inst).await;

        let err = transition(&store, &id, InstanceStatus::Stalled, PidUpdate::Keep)
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::IllegalTransition { .. }));
        assert_eq!(store.get(&id).await.unwrap().status, InstanceStatus::Started);

        let inst = transition(&store, &id, InstanceStatus::Stopped, PidUpdate::Clear)
            .await
            .unwrap();
        assert_eq!(inst.status, InstanceStatus::Stopped);
        assert_eq!(inst.pid, None);
    }

    #[tokio::test]
    async fn compare_and_set_leaves_other_states_alone() {
        let store = MemoryStore::new();
        let inst = Instance::new("a", "a.sh");
        let id = inst.id.clone();
        store.insert(inst).await;

        let changed = compare_and_set_status(
            &store,
            &id,
            &[InstanceStatus::Starting],
            InstanceStatus::Stalled,
        )
        .await
        .unwrap();
        assert!(!changed);
        assert_eq!(store.get(&id).await.unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn json_store_round_trips_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("records"));

        assert!(store.list().await.unwrap().is_empty());

        let inst = Instance::new("Foo", "Foo.sh");
        store.insert(&inst).await.unwrap();
        let id = inst.id.clone();

        transition(&store, &id, InstanceStatus::Starting, PidUpdate::Set(4242))
            .await
            .unwrap();

        let reread = JsonFileStore::new(dir.path().join("records"));
        let got = reread.get(&id).await.unwrap();
        assert_eq!(got.status, InstanceStatus::Starting);
        assert_eq!(got.pid, Some(4242));
        assert_eq!(reread.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.get(&InstanceId::from("../etc")).await.unwrap_err();
        assert!(matches!(err, InstanceError::NotFound(_)));
    }
}
