use chrono::{DateTime, Utc};

use super::{error::Error, protocol::Protocol};

// Identifies the object which holds a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl SlotReference {
    pub fn new(kind: &str, namespace: &str, name: &str) -> SlotReference {
        SlotReference {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for SlotReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// The atomic allocatable unit.
///
/// `end_port` is 0 when the owning list is not segmented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSlot {
    pub start_port: u16,
    pub end_port: u16,
    pub used: bool,
    pub reference: Option<SlotReference>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl PortSlot {
    fn new(start_port: u16, end_port: u16) -> PortSlot {
        PortSlot {
            start_port,
            end_port,
            used: false,
            reference: None,
            claimed_at: None,
        }
    }

    pub fn matches(&self, start_port: u16, end_port: u16) -> bool {
        self.start_port == start_port && self.end_port == end_port
    }

    fn claim(&mut self, now: DateTime<Utc>) {
        self.used = true;
        self.reference = None;
        self.claimed_at = Some(now);
    }

    fn clear(&mut self) {
        self.used = false;
        self.reference = None;
        self.claimed_at = None;
    }
}

/// Ordered slots of one protocol in one pool item.
/// Slots are kept in ascending port order.
#[derive(Debug, Clone)]
pub struct PortList {
    protocol: Protocol,
    start_port: u16,
    end_port: u16,
    segment_length: u16,
    slots: Vec<PortSlot>,
    allocated: usize,
}

impl PortList {
    pub fn new(
        protocol: Protocol,
        start_port: u16,
        end_port: u16,
        segment_length: Option<u16>,
    ) -> Result<PortList, Error> {
        if start_port == 0 || start_port > end_port {
            return Err(Error::InvalidRange(start_port, end_port));
        }
        let segment_length = segment_length.unwrap_or(1).max(1);
        let slots = build_slots(start_port as u32, end_port as u32, segment_length as u32);
        if slots.is_empty() {
            // the range is shorter than one segment
            return Err(Error::InvalidRange(start_port, end_port));
        }
        Ok(PortList {
            protocol,
            start_port,
            end_port,
            segment_length,
            slots,
            allocated: 0,
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    pub fn end_port(&self) -> u16 {
        self.end_port
    }

    pub fn is_segmented(&self) -> bool {
        self.segment_length > 1
    }

    pub fn slots(&self) -> &[PortSlot] {
        &self.slots
    }

    pub fn allocated_port_num(&self) -> usize {
        self.allocated
    }

    pub fn available_port_num(&self) -> usize {
        self.slots.len()
    }

    // Strict first-fit by list order.
    pub fn allocate(&mut self, now: DateTime<Utc>) -> Result<PortSlot, Error> {
        let index = self
            .slots
            .iter()
            .position(|s| !s.used)
            .ok_or(Error::NoAvailablePort)?;
        Ok(self.claim_at(index, now))
    }

    pub(crate) fn claim_at(&mut self, index: usize, now: DateTime<Utc>) -> PortSlot {
        let slot = &mut self.slots[index];
        slot.claim(now);
        self.allocated += 1;
        slot.clone()
    }

    pub fn position(&self, start_port: u16, end_port: u16) -> Option<usize> {
        self.slots.iter().position(|s| s.matches(start_port, end_port))
    }

    pub(crate) fn free_position(&self, start_port: u16, end_port: u16) -> Option<usize> {
        self.position(start_port, end_port)
            .filter(|i| !self.slots[*i].used)
    }

    pub fn get(&self, start_port: u16, end_port: u16) -> Option<&PortSlot> {
        self.position(start_port, end_port).map(|i| &self.slots[i])
    }

    /// Returns false when the slot doesn't exist or is already free.
    pub fn release(&mut self, start_port: u16, end_port: u16) -> bool {
        match self.position(start_port, end_port) {
            Some(i) if self.slots[i].used => {
                self.slots[i].clear();
                self.allocated -= 1;
                true
            }
            _ => false,
        }
    }

    /// Marks the slot as used regardless of its current state.
    /// A given reference overwrites the existing one.
    /// Returns false when the slot doesn't exist.
    pub fn set_used(
        &mut self,
        start_port: u16,
        end_port: u16,
        reference: Option<SlotReference>,
        now: DateTime<Utc>,
    ) -> bool {
        let index = match self.position(start_port, end_port) {
            Some(i) => i,
            None => return false,
        };
        if !self.slots[index].used {
            self.claim_at(index, now);
        }
        if reference.is_some() {
            self.slots[index].reference = reference;
        }
        true
    }

    pub fn increase_end_port(&mut self, new_end_port: u16) -> Result<(), Error> {
        if new_end_port <= self.end_port {
            return Err(Error::InvalidEndPort {
                current: self.end_port,
                new: new_end_port,
            });
        }
        let next = match self.slots.last() {
            Some(s) if self.is_segmented() => s.end_port as u32 + 1,
            Some(s) => s.start_port as u32 + 1,
            None => self.start_port as u32,
        };
        let mut added = build_slots(next, new_end_port as u32, self.segment_length as u32);
        self.slots.append(&mut added);
        self.end_port = new_end_port;
        Ok(())
    }
}

fn build_slots(start: u32, end: u32, segment_length: u32) -> Vec<PortSlot> {
    let mut slots = Vec::new();
    if segment_length <= 1 {
        for port in start..=end {
            slots.push(PortSlot::new(port as u16, 0));
        }
        return slots;
    }
    let mut s = start;
    while s + segment_length - 1 <= end {
        slots.push(PortSlot::new(s as u16, (s + segment_length - 1) as u16));
        s += segment_length;
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest(
        start,
        end,
        segment,
        expected,
        case(30000, 30010, None, 11),
        case(30000, 30010, Some(1), 11),
        case(30000, 30009, Some(5), 2),
        case(30000, 30010, Some(5), 2),
        case(30000, 30000, None, 1),
    )]
    fn works_port_list_new(start: u16, end: u16, segment: Option<u16>, expected: usize) {
        let list = PortList::new(Protocol::TCP, start, end, segment).unwrap();
        assert_eq!(list.available_port_num(), expected);
        assert_eq!(list.allocated_port_num(), 0);
    }

    #[rstest(
        start,
        end,
        segment,
        case(0, 10, None),
        case(30010, 30000, None),
        case(30000, 30003, Some(5)),
    )]
    fn fails_port_list_new(start: u16, end: u16, segment: Option<u16>) {
        assert_eq!(
            PortList::new(Protocol::TCP, start, end, segment).unwrap_err(),
            Error::InvalidRange(start, end)
        );
    }

    #[test]
    fn works_segment_layout() {
        let list = PortList::new(Protocol::UDP, 30000, 30009, Some(5)).unwrap();
        let ranges = list
            .slots()
            .iter()
            .map(|s| (s.start_port, s.end_port))
            .collect::<Vec<(u16, u16)>>();
        assert_eq!(ranges, vec![(30000, 30004), (30005, 30009)]);
    }

    #[test]
    fn works_allocate_first_fit() {
        let now = Utc::now();
        let mut list = PortList::new(Protocol::TCP, 30000, 30002, None).unwrap();
        assert_eq!(list.allocate(now).unwrap().start_port, 30000);
        assert_eq!(list.allocate(now).unwrap().start_port, 30001);
        assert!(list.release(30000, 0));
        assert_eq!(list.allocate(now).unwrap().start_port, 30000);
        assert_eq!(list.allocate(now).unwrap().start_port, 30002);
        assert_eq!(list.allocate(now).unwrap_err(), Error::NoAvailablePort);
        assert_eq!(list.allocated_port_num(), 3);
        assert_eq!(list.available_port_num(), 3);
    }

    #[test]
    fn works_release_idempotent() {
        let now = Utc::now();
        let mut list = PortList::new(Protocol::TCP, 30000, 30002, None).unwrap();
        list.allocate(now).unwrap();
        assert!(list.release(30000, 0));
        assert!(!list.release(30000, 0));
        assert!(!list.release(30001, 0));
        assert!(!list.release(40000, 0));
        assert_eq!(list.allocated_port_num(), 0);
    }

    #[test]
    fn works_set_used() {
        let now = Utc::now();
        let mut list = PortList::new(Protocol::TCP, 30000, 30002, None).unwrap();
        let reference = SlotReference::new("Pod", "default", "pod-a");
        assert!(list.set_used(30001, 0, Some(reference.clone()), now));
        assert!(list.set_used(30001, 0, None, now));
        assert!(!list.set_used(30005, 0, None, now));
        assert_eq!(list.allocated_port_num(), 1);
        let slot = list.get(30001, 0).unwrap();
        assert!(slot.used);
        assert_eq!(slot.reference, Some(reference));
        assert_eq!(list.allocate(now).unwrap().start_port, 30000);
    }

    #[rstest(
        segment,
        new_end,
        expected,
        case(None, 30005, vec![(30000, 0), (30001, 0), (30002, 0), (30003, 0), (30004, 0), (30005, 0)]),
        case(Some(2), 30007, vec![(30000, 30001), (30002, 30003), (30004, 30005), (30006, 30007)]),
        case(Some(2), 30006, vec![(30000, 30001), (30002, 30003), (30004, 30005)]),
    )]
    fn works_increase_end_port(segment: Option<u16>, new_end: u16, expected: Vec<(u16, u16)>) {
        let end = if segment.is_some() { 30003 } else { 30002 };
        let mut list = PortList::new(Protocol::TCP, 30000, end, segment).unwrap();
        list.allocate(Utc::now()).unwrap();
        list.increase_end_port(new_end).unwrap();
        let ranges = list
            .slots()
            .iter()
            .map(|s| (s.start_port, s.end_port))
            .collect::<Vec<(u16, u16)>>();
        assert_eq!(ranges, expected);
        assert_eq!(list.allocated_port_num(), 1);
        assert_eq!(list.end_port(), new_end);
    }

    #[test]
    fn fails_increase_end_port() {
        let mut list = PortList::new(Protocol::TCP, 30000, 30002, None).unwrap();
        assert_eq!(
            list.increase_end_port(30002).unwrap_err(),
            Error::InvalidEndPort {
                current: 30002,
                new: 30002
            }
        );
        assert_eq!(list.available_port_num(), 3);
    }
}
