use chrono::{DateTime, Utc};

use super::{
    error::Error,
    port_list::{PortList, PortSlot},
    protocol::Protocol,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    #[default]
    Active,
    Deleting,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadBalancerEndpoint {
    pub id: String,
    // VIP or domain name exposed by the load balancer
    pub address: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ItemStatus {
    pub phase: ItemPhase,
    pub region: String,
    pub load_balancers: Vec<LoadBalancerEndpoint>,
}

impl ItemStatus {
    pub fn is_deleting(&self) -> bool {
        self.phase == ItemPhase::Deleting
    }
}

/// How ports of one pool item are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPolicy {
    pub item_name: String,
    pub start_port: u16,
    pub end_port: u16,
    pub segment_length: Option<u16>,
    pub protocols: Vec<Protocol>,
}

/// Port lists of every protocol declared by one pool item.
/// The first declared protocol drives joint allocations.
#[derive(Debug, Clone)]
pub struct PoolItemCache {
    policy: AllocationPolicy,
    status: ItemStatus,
    lists: Vec<PortList>,
}

impl PoolItemCache {
    pub fn new(policy: AllocationPolicy, status: ItemStatus) -> Result<PoolItemCache, Error> {
        if policy.protocols.is_empty() {
            return Err(Error::NoProtocol);
        }
        let mut lists: Vec<PortList> = Vec::with_capacity(policy.protocols.len());
        for protocol in policy.protocols.iter() {
            if lists.iter().any(|l| l.protocol() == *protocol) {
                return Err(Error::DuplicatedProtocol(*protocol));
            }
            lists.push(PortList::new(
                *protocol,
                policy.start_port,
                policy.end_port,
                policy.segment_length,
            )?);
        }
        Ok(PoolItemCache {
            policy,
            status,
            lists,
        })
    }

    pub fn name(&self) -> &str {
        &self.policy.item_name
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    pub fn status(&self) -> &ItemStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
    }

    pub fn supports(&self, protocol: Protocol) -> bool {
        self.lists.iter().any(|l| l.protocol() == protocol)
    }

    pub fn is_multi_protocol(&self) -> bool {
        self.lists.len() >= 2
    }

    pub fn port_lists(&self) -> &[PortList] {
        &self.lists
    }

    pub fn port_list(&self, protocol: Protocol) -> Option<&PortList> {
        self.lists.iter().find(|l| l.protocol() == protocol)
    }

    pub fn port_list_mut(&mut self, protocol: Protocol) -> Option<&mut PortList> {
        self.lists.iter_mut().find(|l| l.protocol() == protocol)
    }

    pub fn allocate(&mut self, protocol: Protocol, now: DateTime<Utc>) -> Result<PortSlot, Error> {
        self.port_list_mut(protocol)
            .ok_or(Error::ProtocolNotSupported(protocol))?
            .allocate(now)
    }

    // Reserves the same (start, end) position in every protocol's list, or nothing.
    // Peers are matched by port range, not by index.
    pub fn allocate_all_protocols(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Protocol, PortSlot)>, Error> {
        if !self.is_multi_protocol() {
            return Err(Error::NotMultiProtocol);
        }
        let (driver, peers) = self.lists.split_first_mut().ok_or(Error::NoProtocol)?;

        let mut found: Option<(usize, Vec<usize>)> = None;
        for (index, slot) in driver.slots().iter().enumerate() {
            if slot.used {
                continue;
            }
            let positions = peers
                .iter()
                .map(|l| l.free_position(slot.start_port, slot.end_port))
                .collect::<Option<Vec<usize>>>();
            if let Some(positions) = positions {
                found = Some((index, positions));
                break;
            }
        }
        let (index, positions) = found.ok_or(Error::NoAvailablePort)?;

        let mut res = Vec::with_capacity(peers.len() + 1);
        res.push((driver.protocol(), driver.claim_at(index, now)));
        for (list, position) in peers.iter_mut().zip(positions) {
            res.push((list.protocol(), list.claim_at(position, now)));
        }
        Ok(res)
    }

    pub fn increase_end_port(&mut self, new_end_port: u16) -> Result<(), Error> {
        if new_end_port <= self.policy.end_port {
            return Err(Error::InvalidEndPort {
                current: self.policy.end_port,
                new: new_end_port,
            });
        }
        for list in self.lists.iter_mut() {
            list.increase_end_port(new_end_port)?;
        }
        self.policy.end_port = new_end_port;
        Ok(())
    }

    pub fn used_slots(&self) -> impl Iterator<Item = (Protocol, &PortSlot)> {
        self.lists
            .iter()
            .flat_map(|l| {
                l.slots()
                    .iter()
                    .filter(|s| s.used)
                    .map(move |s| (l.protocol(), s))
            })
    }
}
