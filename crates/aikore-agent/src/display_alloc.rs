use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use aikore_instance::InstanceId;

use crate::error::Result;
use crate::store::InstanceStore;

/// X lock file written by a display server holding display `n`.
pub fn x_lock_path(lock_dir: &Path, display: u32) -> PathBuf {
    lock_dir.join(format!(".X{display}-lock"))
}

/// First display number `>= base` without a lock file that no record claims.
///
/// Probing is monotonic and unbounded; the lock files are the only host
/// signal of a display in use.
pub fn pick_display(base: u32, lock_dir: &Path, claimed: &BTreeSet<u32>) -> u32 {
    let mut n = base;
    while claimed.contains(&n) || x_lock_path(lock_dir, n).exists() {
        n = n.saturating_add(1);
    }
    n
}

pub async fn find_free_display(
    store: &dyn InstanceStore,
    base: u32,
    lock_dir: &Path,
    exclude: Option<&InstanceId>,
) -> Result<u32> {
    let claimed: BTreeSet<u32> = store
        .list()
        .await?
        .into_iter()
        .filter(|inst| Some(&inst.id) != exclude)
        .filter_map(|inst| inst.display)
        .collect();
    Ok(pick_display(base, lock_dir, &claimed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use aikore_instance::Instance;

    #[test]
    fn skips_locked_displays() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(x_lock_path(dir.path(), 10), "").unwrap();
        std::fs::write(x_lock_path(dir.path(), 11), "").unwrap();
        assert_eq!(pick_display(10, dir.path(), &BTreeSet::new()), 12);
    }

    #[tokio::test]
    async fn skips_displays_claimed_by_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(x_lock_path(dir.path(), 10), "").unwrap();

        let store = MemoryStore::new();
        let mut inst = Instance::new("desk", "x.sh");
        inst.display = Some(11);
        let id = inst.id.clone();
        store.insert(inst).await;

        assert_eq!(
            find_free_display(&store, 10, dir.path(), None).await.unwrap(),
            12
        );
        assert_eq!(
            find_free_display(&store, 10, dir.path(), Some(&id)).await.unwrap(),
            11
        );
    }
}
