use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use chrono::{DateTime, Duration, Utc};

use super::{
    error::Error,
    pool_item::{AllocationPolicy, ItemStatus, PoolItemCache},
    port_list::{PortSlot, SlotReference},
    protocol::Protocol,
};

pub const DEFAULT_LEAK_GRACE_PERIOD_SECS: i64 = 30 * 60;

// Pool keys are formatted as `<name>/<namespace>`.
pub fn pool_key(name: &str, namespace: &str) -> String {
    format!("{name}/{namespace}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub pool_key: String,
    pub item_name: String,
    pub protocol: Protocol,
    pub start_port: u16,
    pub end_port: u16,
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}-{}",
            self.pool_key, self.item_name, self.protocol, self.start_port, self.end_port
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub pool_key: String,
    pub item_name: String,
    pub protocol: Protocol,
    pub slot: PortSlot,
    pub item_status: ItemStatus,
}

impl PortAllocation {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            pool_key: self.pool_key.clone(),
            item_name: self.item_name.clone(),
            protocol: self.protocol,
            start_port: self.slot.start_port,
            end_port: self.slot.end_port,
        }
    }
}

/// Process wide port pool cache.
///
/// Every operation goes through the guard returned by `lock()`,
/// so a caller can run several allocations and releases as one atomic sequence.
#[derive(Debug, Clone, Default)]
pub struct PortPoolCache {
    inner: Arc<Mutex<PortPoolCacheInner>>,
    ready: Arc<AtomicBool>,
}

impl PortPoolCache {
    pub fn new() -> PortPoolCache {
        PortPoolCache::default()
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, PortPoolCacheInner>, Error> {
        self.inner.lock().map_err(|_| Error::FailedToGetLock)
    }

    // Set once allocations stored in the cluster are recovered.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release)
    }
}

#[derive(Debug, Default)]
pub struct PortPoolCacheInner {
    pools: HashMap<String, PoolCache>,
}

#[derive(Debug, Default)]
struct PoolCache {
    // kept in insertion order for first-fit scans
    items: Vec<PoolItemCache>,
}

impl PoolCache {
    fn get(&self, item_name: &str) -> Option<&PoolItemCache> {
        self.items.iter().find(|i| i.name() == item_name)
    }

    fn get_mut(&mut self, item_name: &str) -> Option<&mut PoolItemCache> {
        self.items.iter_mut().find(|i| i.name() == item_name)
    }
}

impl PortPoolCacheInner {
    pub fn add_pool_item(
        &mut self,
        pool_key: &str,
        policy: AllocationPolicy,
        status: ItemStatus,
    ) -> Result<(), Error> {
        let pool = self.pools.entry(pool_key.to_string()).or_default();
        if pool.get(&policy.item_name).is_some() {
            return Err(Error::ItemAlreadyExists(policy.item_name));
        }
        let item = PoolItemCache::new(policy, status)?;
        tracing::info!(pool = pool_key, item = item.name(), "Add pool item");
        pool.items.push(item);
        Ok(())
    }

    pub fn allocate_port_binding(
        &mut self,
        pool_key: &str,
        protocol: Protocol,
        item_name: Option<&str>,
    ) -> Result<PortAllocation, Error> {
        let now = Utc::now();
        let pool = self
            .pools
            .get_mut(pool_key)
            .ok_or(Error::PoolNotFound(pool_key.to_string()))?;

        if let Some(name) = item_name {
            let item = pool
                .get_mut(name)
                .ok_or(Error::ItemNotFound(name.to_string()))?;
            if item.status().is_deleting() {
                return Err(Error::ItemDeleting(name.to_string()));
            }
            let slot = item.allocate(protocol, now)?;
            return Ok(allocation(pool_key, item, protocol, slot));
        }

        for item in pool.items.iter_mut() {
            if item.status().is_deleting() || !item.supports(protocol) {
                continue;
            }
            match item.allocate(protocol, now) {
                Ok(slot) => return Ok(allocation(pool_key, item, protocol, slot)),
                Err(Error::NoAvailablePort) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoAvailablePort)
    }

    pub fn allocate_all_protocol_port_binding(
        &mut self,
        pool_key: &str,
        item_name: Option<&str>,
    ) -> Result<Vec<PortAllocation>, Error> {
        let now = Utc::now();
        let pool = self
            .pools
            .get_mut(pool_key)
            .ok_or(Error::PoolNotFound(pool_key.to_string()))?;

        if let Some(name) = item_name {
            let item = pool
                .get_mut(name)
                .ok_or(Error::ItemNotFound(name.to_string()))?;
            if item.status().is_deleting() {
                return Err(Error::ItemDeleting(name.to_string()));
            }
            let slots = item.allocate_all_protocols(now)?;
            return Ok(slots
                .into_iter()
                .map(|(p, s)| allocation(pool_key, item, p, s))
                .collect());
        }

        for item in pool.items.iter_mut() {
            if item.status().is_deleting() || !item.is_multi_protocol() {
                continue;
            }
            match item.allocate_all_protocols(now) {
                Ok(slots) => {
                    return Ok(slots
                        .into_iter()
                        .map(|(p, s)| allocation(pool_key, item, p, s))
                        .collect())
                }
                Err(Error::NoAvailablePort) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoAvailablePort)
    }

    // Releasing an unknown or already free slot is not an error.
    pub fn release_port_binding(&mut self, key: &SlotKey) -> bool {
        let released = self
            .pools
            .get_mut(&key.pool_key)
            .and_then(|pool| pool.get_mut(&key.item_name))
            .and_then(|item| item.port_list_mut(key.protocol))
            .map(|list| list.release(key.start_port, key.end_port));
        match released {
            Some(true) => {
                tracing::info!(slot = key.to_string(), "Release port binding");
                true
            }
            Some(false) => false,
            None => {
                tracing::warn!(slot = key.to_string(), "Port binding to release is not found");
                false
            }
        }
    }

    pub fn set_port_binding_used(&mut self, key: &SlotKey, reference: Option<SlotReference>) -> bool {
        let now = Utc::now();
        let found = self
            .pools
            .get_mut(&key.pool_key)
            .and_then(|pool| pool.get_mut(&key.item_name))
            .and_then(|item| item.port_list_mut(key.protocol))
            .map(|list| list.set_used(key.start_port, key.end_port, reference, now))
            .unwrap_or(false);
        if !found {
            tracing::warn!(slot = key.to_string(), "Port binding to mark is not found");
        }
        found
    }

    pub fn increase_end_port(
        &mut self,
        pool_key: &str,
        item_name: &str,
        new_end_port: u16,
    ) -> Result<(), Error> {
        self.get_item_mut(pool_key, item_name)?
            .increase_end_port(new_end_port)
    }

    pub fn update_item_status(
        &mut self,
        pool_key: &str,
        item_name: &str,
        status: ItemStatus,
    ) -> Result<(), Error> {
        self.get_item_mut(pool_key, item_name)?.set_status(status);
        Ok(())
    }

    // Removes the pool entry as well when its last item is deleted.
    pub fn delete_port_pool_item(&mut self, pool_key: &str, item_name: &str) -> Option<PoolItemCache> {
        let pool = self.pools.get_mut(pool_key)?;
        let index = pool.items.iter().position(|i| i.name() == item_name)?;
        let removed = pool.items.remove(index);
        if pool.items.is_empty() {
            self.pools.remove(pool_key);
        }
        tracing::info!(pool = pool_key, item = item_name, "Delete pool item");
        Some(removed)
    }

    pub fn contains_pool(&self, pool_key: &str) -> bool {
        self.pools.contains_key(pool_key)
    }

    pub fn get_item(&self, pool_key: &str, item_name: &str) -> Option<&PoolItemCache> {
        self.pools.get(pool_key).and_then(|p| p.get(item_name))
    }

    pub fn items(&self, pool_key: &str) -> Vec<&PoolItemCache> {
        self.pools
            .get(pool_key)
            .map(|p| p.items.iter().collect())
            .unwrap_or_default()
    }

    fn get_item_mut(&mut self, pool_key: &str, item_name: &str) -> Result<&mut PoolItemCache, Error> {
        self.pools
            .get_mut(pool_key)
            .ok_or(Error::PoolNotFound(pool_key.to_string()))?
            .get_mut(item_name)
            .ok_or(Error::ItemNotFound(item_name.to_string()))
    }

    pub fn used_slots(&self) -> Vec<(SlotKey, PortSlot)> {
        let mut res = Vec::new();
        for (pool_key, pool) in self.pools.iter() {
            for item in pool.items.iter() {
                for (protocol, slot) in item.used_slots() {
                    res.push((
                        SlotKey {
                            pool_key: pool_key.clone(),
                            item_name: item.name().to_string(),
                            protocol,
                            start_port: slot.start_port,
                            end_port: slot.end_port,
                        },
                        slot.clone(),
                    ));
                }
            }
        }
        res.sort_by(|a, b| a.0.cmp(&b.0));
        res
    }

    // Used slots that nobody has claimed a reference to within the grace period.
    pub fn leaked_slots(&self, now: DateTime<Utc>, grace: Duration) -> Vec<SlotKey> {
        self.used_slots()
            .into_iter()
            .filter(|(_, slot)| {
                slot.reference.is_none()
                    && slot
                        .claimed_at
                        .map(|at| now.signed_duration_since(at) > grace)
                        .unwrap_or(true)
            })
            .map(|(key, _)| key)
            .collect()
    }
}

fn allocation(
    pool_key: &str,
    item: &PoolItemCache,
    protocol: Protocol,
    slot: PortSlot,
) -> PortAllocation {
    PortAllocation {
        pool_key: pool_key.to_string(),
        item_name: item.name().to_string(),
        protocol,
        slot,
        item_status: item.status().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool_item::ItemPhase;
    use rstest::rstest;

    fn test_policy(name: &str, start: u16, end: u16, protocols: Vec<Protocol>) -> AllocationPolicy {
        AllocationPolicy {
            item_name: name.to_string(),
            start_port: start,
            end_port: end,
            segment_length: None,
            protocols,
        }
    }

    fn test_cache() -> PortPoolCache {
        let cache = PortPoolCache::new();
        {
            let mut inner = cache.lock().unwrap();
            inner
                .add_pool_item(
                    "p1/ns",
                    test_policy("it1", 30000, 30010, vec![Protocol::TCP]),
                    ItemStatus::default(),
                )
                .unwrap();
            inner
                .add_pool_item(
                    "p1/ns",
                    test_policy("it2", 31000, 31001, vec![Protocol::TCP, Protocol::UDP]),
                    ItemStatus::default(),
                )
                .unwrap();
        }
        cache
    }

    fn key(item: &str, protocol: Protocol, start: u16) -> SlotKey {
        SlotKey {
            pool_key: "p1/ns".to_string(),
            item_name: item.to_string(),
            protocol,
            start_port: start,
            end_port: 0,
        }
    }

    #[test]
    fn works_allocate_port_binding_sequentially() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        let a = inner
            .allocate_port_binding("p1/ns", Protocol::TCP, Some("it1"))
            .unwrap();
        let b = inner
            .allocate_port_binding("p1/ns", Protocol::TCP, Some("it1"))
            .unwrap();
        assert_eq!(a.slot.start_port, 30000);
        assert_eq!(b.slot.start_port, 30001);
        assert!(a.slot.used);
        assert!(b.slot.used);
        let list = inner
            .get_item("p1/ns", "it1")
            .unwrap()
            .port_list(Protocol::TCP)
            .unwrap();
        assert_eq!(list.allocated_port_num(), 2);
    }

    #[test]
    fn works_release_then_reuse_lowest() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        for _ in 0..3 {
            inner
                .allocate_port_binding("p1/ns", Protocol::TCP, Some("it1"))
                .unwrap();
        }
        assert!(inner.release_port_binding(&key("it1", Protocol::TCP, 30001)));
        let c = inner
            .allocate_port_binding("p1/ns", Protocol::TCP, None)
            .unwrap();
        assert_eq!(c.item_name, "it1");
        assert_eq!(c.slot.start_port, 30001);
    }

    #[test]
    fn works_release_idempotent() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        inner
            .allocate_port_binding("p1/ns", Protocol::TCP, Some("it1"))
            .unwrap();
        assert!(inner.release_port_binding(&key("it1", Protocol::TCP, 30000)));
        assert!(!inner.release_port_binding(&key("it1", Protocol::TCP, 30000)));
        assert!(!inner.release_port_binding(&key("it1", Protocol::TCP, 30005)));
        assert!(!inner.release_port_binding(&key("unknown", Protocol::TCP, 30000)));
        let list = inner
            .get_item("p1/ns", "it1")
            .unwrap()
            .port_list(Protocol::TCP)
            .unwrap();
        assert_eq!(list.allocated_port_num(), 0);
        assert_eq!(list.available_port_num(), 11);
    }

    #[test]
    fn works_allocate_all_protocol_port_binding() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        let allocs = inner
            .allocate_all_protocol_port_binding("p1/ns", None)
            .unwrap();
        assert_eq!(allocs.len(), 2);
        assert!(allocs.iter().all(|a| a.item_name == "it2"));
        assert!(allocs.iter().all(|a| a.slot.start_port == 31000));

        // UDP 31001 is taken, so the only remaining position can't be reserved jointly
        inner.set_port_binding_used(&key("it2", Protocol::UDP, 31001), None);
        assert_eq!(
            inner
                .allocate_all_protocol_port_binding("p1/ns", Some("it2"))
                .unwrap_err(),
            Error::NoAvailablePort
        );
        let tcp = inner
            .get_item("p1/ns", "it2")
            .unwrap()
            .port_list(Protocol::TCP)
            .unwrap();
        assert_eq!(tcp.allocated_port_num(), 1);
    }

    #[rstest(
        pool,
        item,
        expected,
        case("p2/ns", Some("it1"), Error::PoolNotFound("p2/ns".to_string())),
        case("p1/ns", Some("it3"), Error::ItemNotFound("it3".to_string())),
        case("p1/ns", Some("it1"), Error::NotMultiProtocol),
    )]
    fn fails_allocate_all_protocol_port_binding(pool: &str, item: Option<&str>, expected: Error) {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        assert_eq!(
            inner
                .allocate_all_protocol_port_binding(pool, item)
                .unwrap_err(),
            expected
        );
    }

    #[test]
    fn works_no_available_port_across_items() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        // 11 ports in it1 and 2 TCP ports in it2
        for _ in 0..13 {
            inner
                .allocate_port_binding("p1/ns", Protocol::TCP, None)
                .unwrap();
        }
        assert_eq!(
            inner
                .allocate_port_binding("p1/ns", Protocol::TCP, None)
                .unwrap_err(),
            Error::NoAvailablePort
        );
        let udp = inner
            .allocate_port_binding("p1/ns", Protocol::UDP, None)
            .unwrap();
        assert_eq!(udp.item_name, "it2");
    }

    #[test]
    fn works_skip_deleting_item() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        inner
            .update_item_status(
                "p1/ns",
                "it1",
                ItemStatus {
                    phase: ItemPhase::Deleting,
                    ..Default::default()
                },
            )
            .unwrap();
        let a = inner
            .allocate_port_binding("p1/ns", Protocol::TCP, None)
            .unwrap();
        assert_eq!(a.item_name, "it2");
        assert!(a.item_status.phase == ItemPhase::Active);
        assert_eq!(
            inner
                .allocate_port_binding("p1/ns", Protocol::TCP, Some("it1"))
                .unwrap_err(),
            Error::ItemDeleting("it1".to_string())
        );
    }

    #[test]
    fn fails_add_duplicated_item() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        assert_eq!(
            inner
                .add_pool_item(
                    "p1/ns",
                    test_policy("it1", 40000, 40001, vec![Protocol::TCP]),
                    ItemStatus::default(),
                )
                .unwrap_err(),
            Error::ItemAlreadyExists("it1".to_string())
        );
    }

    #[test]
    fn works_delete_last_item_removes_pool() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        assert!(inner.delete_port_pool_item("p1/ns", "it1").is_some());
        assert!(inner.contains_pool("p1/ns"));
        assert!(inner.delete_port_pool_item("p1/ns", "it1").is_none());
        assert!(inner.delete_port_pool_item("p1/ns", "it2").is_some());
        assert!(!inner.contains_pool("p1/ns"));
    }

    #[test]
    fn works_increase_end_port() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        inner.increase_end_port("p1/ns", "it1", 30020).unwrap();
        let list = inner
            .get_item("p1/ns", "it1")
            .unwrap()
            .port_list(Protocol::TCP)
            .unwrap();
        assert_eq!(list.available_port_num(), 21);
        assert!(inner.increase_end_port("p1/ns", "it1", 30010).is_err());
    }

    #[test]
    fn works_leaked_slots() {
        let cache = test_cache();
        let mut inner = cache.lock().unwrap();
        inner
            .allocate_port_binding("p1/ns", Protocol::TCP, Some("it1"))
            .unwrap();
        inner
            .allocate_port_binding("p1/ns", Protocol::TCP, Some("it1"))
            .unwrap();
        inner.set_port_binding_used(
            &key("it1", Protocol::TCP, 30001),
            Some(SlotReference::new("Pod", "default", "pod-a")),
        );
        let grace = Duration::seconds(DEFAULT_LEAK_GRACE_PERIOD_SECS);

        assert!(inner.leaked_slots(Utc::now(), grace).is_empty());
        let later = Utc::now() + Duration::minutes(31);
        assert_eq!(
            inner.leaked_slots(later, grace),
            vec![key("it1", Protocol::TCP, 30000)]
        );
    }

    #[test]
    fn works_no_double_allocation_under_threads() {
        let cache = test_cache();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = cache.clone();
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..3 {
                    let mut inner = c.lock().unwrap();
                    if let Ok(a) = inner.allocate_port_binding("p1/ns", Protocol::TCP, None) {
                        got.push(a.key());
                    }
                }
                got
            }));
        }
        let mut all = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<SlotKey>>();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 12);
        assert_eq!(all.len(), 12);
    }
}
