use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use kube::{api::ListParams, Api, Client, ResourceExt};

use portd_allocator::{manager::SlotKey, protocol::Protocol};

use crate::{
    controller::{component::Component, error::Error, metrics::Metrics},
    crd::port_binding::PortBinding,
};

/// Two or more bindings holding overlapping ports of one pool item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub pool_key: String,
    pub item_name: String,
    pub protocol: Protocol,
    pub start_port: u16,
    pub end_port: u16,
    // `<namespace>/<name>` of every binding involved
    pub bindings: Vec<String>,
}

/// Releases slots which were claimed but never referenced by a binding
/// within the grace period.
pub fn release_leaked_slots(
    component: &Component,
    metrics: &Mutex<Metrics>,
    now: DateTime<Utc>,
) -> Result<Vec<SlotKey>, Error> {
    let mut cache = component.cache.lock().map_err(Error::Allocator)?;
    let leaked = cache.leaked_slots(now, component.settings.leak_grace_period);
    for key in leaked.iter() {
        tracing::warn!(slot = key.to_string(), "Release leaked port binding");
        cache.release_port_binding(key);
        metrics
            .lock()
            .map_err(|_| Error::FailedToGetLock)?
            .leaked_slot_inc(&key.pool_key, &key.item_name);
    }
    Ok(leaked)
}

pub fn find_conflicts(bindings: &[PortBinding]) -> Vec<Conflict> {
    // (pool, item, protocol) -> [(start, end, binding)]
    let mut ranges: BTreeMap<(String, String, Protocol), Vec<(u16, u16, String)>> = BTreeMap::new();
    for b in bindings.iter() {
        let owner = format!("{}/{}", b.namespace().unwrap_or_default(), b.name_any());
        for item in b.spec.items.iter() {
            let end = if item.end_port == 0 {
                item.start_port
            } else {
                item.end_port
            };
            ranges
                .entry((item.pool_key(), item.pool_item_name.clone(), item.protocol))
                .or_default()
                .push((item.start_port, end, owner.clone()));
        }
    }

    let mut conflicts = Vec::new();
    for ((pool_key, item_name, protocol), mut list) in ranges.into_iter() {
        list.sort();
        let mut i = 0;
        while i < list.len() {
            let (start, mut end, ref owner) = list[i];
            let mut owners = BTreeSet::from([owner.clone()]);
            let mut j = i + 1;
            while j < list.len() && list[j].0 <= end {
                end = end.max(list[j].1);
                owners.insert(list[j].2.clone());
                j += 1;
            }
            if owners.len() > 1 {
                conflicts.push(Conflict {
                    pool_key: pool_key.clone(),
                    item_name: item_name.clone(),
                    protocol,
                    start_port: start,
                    end_port: end,
                    bindings: owners.into_iter().collect(),
                });
            }
            i = j;
        }
    }
    conflicts
}

async fn report_conflicts(
    client: &Client,
    metrics: &Mutex<Metrics>,
    reported: &mut BTreeSet<String>,
) -> Result<(), Error> {
    let bindings = Api::<PortBinding>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?;
    let conflicts = find_conflicts(&bindings.items);

    let mut counts: BTreeMap<String, i64> = BTreeMap::new();
    for c in conflicts.iter() {
        tracing::error!(
            pool = c.pool_key,
            item = c.item_name,
            protocol = c.protocol.to_string(),
            start_port = c.start_port,
            end_port = c.end_port,
            bindings = ?c.bindings,
            "Port binding conflict"
        );
        *counts.entry(c.pool_key.clone()).or_default() += 1;
    }

    let metrics = metrics.lock().map_err(|_| Error::FailedToGetLock)?;
    for pool in reported.iter() {
        if !counts.contains_key(pool) {
            metrics.binding_conflicts_set(pool, 0);
        }
    }
    for (pool, count) in counts.iter() {
        metrics.binding_conflicts_set(pool, *count);
    }
    *reported = counts.into_keys().collect();
    Ok(())
}

pub async fn run(component: Component, metrics: Arc<Mutex<Metrics>>) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    tracing::info!(
        interval = component.settings.leak_check_interval.as_secs(),
        grace = component.settings.leak_grace_period.num_seconds(),
        "Start leak checker"
    );

    let mut interval = tokio::time::interval(component.settings.leak_check_interval);
    let mut reported = BTreeSet::new();
    loop {
        interval.tick().await;
        if !component.cache.is_ready() {
            continue;
        }
        match release_leaked_slots(&component, &metrics, Utc::now()) {
            Ok(leaked) if !leaked.is_empty() => {
                tracing::info!(count = leaked.len(), "Released leaked port bindings")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error=?e, "Failed to check leaked port bindings"),
        }
        if let Err(e) = report_conflicts(&client, &metrics, &mut reported).await {
            tracing::error!(error=?e, "Failed to check port binding conflicts");
        }
    }
}
