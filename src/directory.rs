use std::{collections::VecDeque, net::SocketAddrV4};

use crate::wire::{Message, ServiceId};

/// One registered service instance.
///
/// Identity is `(service, address)`; the agent port is carried along but two
/// records differing only in agent port are the same instance.
#[derive(Debug, Clone, Copy, Eq)]
pub struct InstanceRecord {
    pub service: ServiceId,
    pub address: SocketAddrV4,
    pub agent_port: u16,
}

impl PartialEq for InstanceRecord {
    fn eq(&self, other: &Self) -> bool {
        (self.service, self.address) == (other.service, other.address)
    }
}

impl std::hash::Hash for InstanceRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.service, self.address).hash(state)
    }
}

impl InstanceRecord {
    pub fn list_add(&self) -> Message {
        Message::ListAdd {
            service: self.service,
            address: self.address,
            agent_port: self.agent_port,
        }
    }

    pub fn agent_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(*self.address.ip(), self.agent_port)
    }
}

/// Per-service FIFO queues of known instances.
#[derive(Debug, Clone, Default)]
pub struct Directory(Vec<VecDeque<InstanceRecord>>);

impl Directory {
    pub fn new(num_service: u8) -> Self {
        Self(vec![Default::default(); num_service as usize])
    }

    pub fn num_service(&self) -> usize {
        self.0.len()
    }

    /// Appends the record unless an equal one is present. Returns `false` for
    /// duplicates and for service ids outside the configured range.
    pub fn register(&mut self, record: InstanceRecord) -> bool {
        let Some(queue) = self.0.get_mut(record.service as usize) else {
            return false;
        };
        if queue.contains(&record) {
            return false;
        }
        queue.push_back(record);
        true
    }

    /// Round robin: the head instance is handed out and moved to the tail.
    pub fn issue(&mut self, service: ServiceId) -> Option<InstanceRecord> {
        let queue = self.0.get_mut(service as usize)?;
        let record = queue.pop_front()?;
        queue.push_back(record);
        Some(record)
    }

    pub fn lookup(&self, service: ServiceId, address: SocketAddrV4) -> Option<&InstanceRecord> {
        self.0
            .get(service as usize)?
            .iter()
            .find(|record| record.address == address)
    }

    pub fn remove(&mut self, service: ServiceId, address: SocketAddrV4) -> Option<InstanceRecord> {
        let queue = self.0.get_mut(service as usize)?;
        let index = queue.iter().position(|record| record.address == address)?;
        queue.remove(index)
    }

    /// All records, service by service, each in round-robin order.
    pub fn records(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.0.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
