//! Open-addressing string set used while merging directory listings.
//!
//! Linear probing from `fnv1a(name) % capacity`. The table doubles and every
//! live name is re-inserted once more than half of the slots are taken, since
//! probe positions depend on the capacity.

use super::hash::fnv1a;

const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct NameSet {
    slots: Vec<Option<Box<str>>>,
    len: usize,
}

impl NameSet {
    /// Size the table for roughly `estimate` names.
    pub fn with_estimate(estimate: usize) -> Self {
        let capacity = estimate.max(MIN_CAPACITY);
        Self {
            slots: vec![None; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Combined lookup/insert. Returns `true` when `name` was already present,
    /// otherwise records it and returns `false`.
    pub fn seen(&mut self, name: &str) -> bool {
        match self.probe(name) {
            Probe::Found => true,
            Probe::Empty(slot) => {
                self.slots[slot] = Some(name.into());
                self.len += 1;
                if self.len > self.capacity() / 2 {
                    self.grow();
                }
                false
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        matches!(self.probe(name), Probe::Found)
    }

    fn probe(&self, name: &str) -> Probe {
        let cap = self.capacity();
        let mut slot = (fnv1a(name.as_bytes()) % cap as u64) as usize;
        loop {
            match &self.slots[slot] {
                None => return Probe::Empty(slot),
                Some(existing) if &**existing == name => return Probe::Found,
                Some(_) => slot = (slot + 1) % cap,
            }
        }
    }

    fn grow(&mut self) {
        let doubled = self.capacity() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; doubled]);
        let cap = self.capacity();
        for name in old.into_iter().flatten() {
            let mut slot = (fnv1a(name.as_bytes()) % cap as u64) as usize;
            while self.slots[slot].is_some() {
                slot = (slot + 1) % cap;
            }
            self.slots[slot] = Some(name);
        }
    }
}

enum Probe {
    Found,
    Empty(usize),
}
