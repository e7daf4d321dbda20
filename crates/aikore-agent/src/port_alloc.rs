use std::{collections::BTreeSet, net::TcpListener, ops::RangeInclusive, sync::Arc};

use aikore_instance::{Instance, InstanceId};
use tokio::sync::Mutex;

use crate::error::{InstanceError, Result};
use crate::registry::Registry;
use crate::store::InstanceStore;

/// Asks the OS for a free TCP port.
///
/// The listener is dropped before returning, so the port is only known to be
/// free at the instant of the call; another process may take it before the
/// instance binds it.
pub fn find_ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}

/// Picks a port from `range` that is not in `claimed`.
///
/// A requested port is validated instead of searched for.
pub fn pick_port(
    range: &RangeInclusive<u16>,
    claimed: &BTreeSet<u16>,
    requested: Option<u16>,
) -> Result<u16> {
    let (start, end) = (*range.start(), *range.end());
    if let Some(port) = requested {
        if !range.contains(&port) {
            return Err(InstanceError::PortOutOfRange { port, start, end });
        }
        if claimed.contains(&port) {
            return Err(InstanceError::PortInUse(port));
        }
        return Ok(port);
    }

    range
        .clone()
        .find(|p| !claimed.contains(p))
        .ok_or(InstanceError::PoolExhausted { start, end })
}

/// Bounded port pool shared by all instances of this host.
pub struct PortPool {
    range: RangeInclusive<u16>,
    store: Arc<dyn InstanceStore>,
    registry: Registry,
    // Held across check -> allocate -> persist.
    lock: Mutex<()>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>, store: Arc<dyn InstanceStore>, registry: Registry) -> Self {
        Self {
            range,
            store,
            registry,
            lock: Mutex::new(()),
        }
    }

    async fn claimed(&self, exclude: Option<&InstanceId>) -> Result<BTreeSet<u16>> {
        let mut claimed: BTreeSet<u16> = self
            .store
            .list()
            .await?
            .iter()
            .filter(|inst| Some(&inst.id) != exclude)
            .flat_map(Instance::claimed_ports)
            .collect();
        claimed.extend(self.registry.claimed_ports(exclude).await);
        Ok(claimed)
    }

    /// Validates `requested` or returns the lowest free port, without persisting it.
    pub async fn allocate(
        &self,
        requested: Option<u16>,
        exclude: Option<&InstanceId>,
    ) -> Result<u16> {
        let _guard = self.lock.lock().await;
        let claimed = self.claimed(exclude).await?;
        pick_port(&self.range, &claimed, requested)
    }

    /// Allocates a bridge port for `id` and records it on the instance in one
    /// locked step, so concurrent starts cannot receive the same port.
    pub async fn claim(&self, id: &InstanceId, requested: Option<u16>) -> Result<u16> {
        let _guard = self.lock.lock().await;
        let claimed = self.claimed(Some(id)).await?;
        let port = pick_port(&self.range, &claimed, requested)?;
        self.store
            .update(
                id,
                Box::new(move |inst| {
                    let changed = inst.bridge_port != Some(port);
                    inst.bridge_port = Some(port);
                    Ok(changed)
                }),
            )
            .await?;
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn ephemeral_port_is_nonzero() {
        let port = find_ephemeral_port().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn pick_port_prefers_lowest_free() {
        let claimed: BTreeSet<u16> = [9000, 9001].into_iter().collect();
        assert_eq!(pick_port(&(9000..=9005), &claimed, None).unwrap(), 9002);
    }

    #[test]
    fn pick_port_validates_requests() {
        let claimed: BTreeSet<u16> = [9001].into_iter().collect();
        assert_eq!(pick_port(&(9000..=9005), &claimed, Some(9003)).unwrap(), 9003);
        assert!(matches!(
            pick_port(&(9000..=9005), &claimed, Some(9001)),
            Err(InstanceError::PortInUse(9001))
        ));
        assert!(matches!(
            pick_port(&(9000..=9005), &claimed, Some(8000)),
            Err(InstanceError::PortOutOfRange { port: 8000, .. })
        ));
    }

    #[tokio::test]
    async fn allocate_excludes_the_instance_being_reallocated() {
        let store = Arc::new(MemoryStore::new());
        let mut inst = Instance::new("a", "a.sh");
        inst.bridge_port = Some(9000);
        let id = inst.id.clone();
        store.insert(inst).await;

        let pool = PortPool::new(9000..=9001, store, Registry::new());
        assert_eq!(pool.allocate(None, None).await.unwrap(), 9001);
        assert_eq!(pool.allocate(None, Some(&id)).await.unwrap(), 9000);
    }

    #[tokio::test]
    async fn concurrent_claims_never_collide_and_exhaust_the_pool() {
        const N: usize = 5;
        let store = Arc::new(MemoryStore::new());
        let mut ids = Vec::new();
        for i in 0..=N {
            let inst = Instance::new(format!("inst-{i}"), "x.sh");
            ids.push(inst.id.clone());
            store.insert(inst).await;
        }

        let pool = Arc::new(PortPool::new(
            20000..=(20000 + N as u16 - 1),
            store.clone(),
            Registry::new(),
        ));

        let mut tasks = Vec::new();
        for id in ids.iter().take(N).cloned() {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.claim(&id, None).await }));
        }
        let mut got = BTreeSet::new();
        for t in tasks {
            let port = t.await.unwrap().unwrap();
            assert!(got.insert(port), "port {port} handed out twice");
        }
        assert_eq!(got.len(), N);

        let err = pool.claim(&ids[N], None).await.unwrap_err();
        assert!(matches!(err, InstanceError::PoolExhausted { .. }));
    }
}
