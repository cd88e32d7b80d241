//! Generation-checked handle table.
//!
//! The table is the single owner of every module and mapping record. Other
//! components hold [`HandleId`]s and resolve them here on every access, so a
//! handle reused after release is rejected instead of aliasing a new record.

use crate::loader::ModuleHandle;
use crate::mapping::Mapping;
use crate::{Error, Result};
use std::fmt;

/// Upper bound on table capacity; slot indices must fit in 16 bits.
pub const MAX_SLOTS: u32 = 0xFFFF;

/// Opaque identifier for a table record.
///
/// Crosses the host boundary as a `u32` (`generation << 16 | index`).
/// Generations start at 1, so the raw value 0 never names a live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    index: u16,
    generation: u16,
}

impl HandleId {
    /// Boundary representation.
    pub fn to_raw(self) -> u32 {
        (u32::from(self.generation) << 16) | u32::from(self.index)
    }

    /// Rebuild an id received from the boundary. Validity is checked on lookup.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            index: (raw & 0xFFFF) as u16,
            generation: (raw >> 16) as u16,
        }
    }

    pub fn index(self) -> u16 {
        self.index
    }

    pub fn generation(self) -> u16 {
        self.generation
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// What a handle stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Module,
    Mapping,
}

/// A record owned by the table.
#[derive(Debug)]
pub enum Record {
    Module(ModuleHandle),
    Mapping(Mapping),
}

impl Record {
    pub fn kind(&self) -> HandleKind {
        match self {
            Record::Module(_) => HandleKind::Module,
            Record::Mapping(_) => HandleKind::Mapping,
        }
    }

    /// Whether the record still has asynchronous work outstanding.
    pub fn is_busy(&self) -> bool {
        match self {
            Record::Module(module) => module.is_busy(),
            Record::Mapping(_) => false,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u16,
    record: Option<Record>,
}

/// Arena of records keyed by [`HandleId`].
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u16>,
    capacity: u32,
    live: usize,
}

impl HandleTable {
    /// Create a table holding at most `capacity` live records.
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity: capacity.min(MAX_SLOTS),
            live: 0,
        }
    }

    /// Store `record` and return its new identifier.
    pub fn allocate(&mut self, record: Record) -> Result<HandleId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() as u32 >= self.capacity {
                    return Err(Error::OutOfHandles);
                }
                self.slots.push(Slot {
                    generation: 1,
                    record: None,
                });
                (self.slots.len() - 1) as u16
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.record = Some(record);
        self.live += 1;

        Ok(HandleId {
            index,
            generation: slot.generation,
        })
    }

    /// Look up a live record.
    pub fn lookup(&self, id: HandleId) -> Result<&Record> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(Error::InvalidHandle)
    }

    /// Look up a live record for mutation.
    pub fn lookup_mut(&mut self, id: HandleId) -> Result<&mut Record> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
            .ok_or(Error::InvalidHandle)
    }

    /// Remove a record and retire its identifier.
    ///
    /// Fails with `Busy` while the record has asynchronous work in flight and
    /// with `InvalidHandle` for unknown or already released ids.
    pub fn release(&mut self, id: HandleId) -> Result<Record> {
        if self.lookup(id)?.is_busy() {
            return Err(Error::Busy);
        }

        let slot = &mut self.slots[id.index as usize];
        let record = slot.record.take().ok_or(Error::InvalidHandle)?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free.push(id.index);
        self.live -= 1;
        Ok(record)
    }

    pub fn module(&self, id: HandleId) -> Result<&ModuleHandle> {
        match self.lookup(id)? {
            Record::Module(module) => Ok(module),
            Record::Mapping(_) => Err(Error::InvalidHandle),
        }
    }

    pub fn module_mut(&mut self, id: HandleId) -> Result<&mut ModuleHandle> {
        match self.lookup_mut(id)? {
            Record::Module(module) => Ok(module),
            Record::Mapping(_) => Err(Error::InvalidHandle),
        }
    }

    pub fn mapping(&self, id: HandleId) -> Result<&Mapping> {
        match self.lookup(id)? {
            Record::Mapping(mapping) => Ok(mapping),
            Record::Module(_) => Err(Error::InvalidHandle),
        }
    }

    pub fn mapping_mut(&mut self, id: HandleId) -> Result<&mut Mapping> {
        match self.lookup_mut(id)? {
            Record::Mapping(mapping) => Ok(mapping),
            Record::Module(_) => Err(Error::InvalidHandle),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty() && self.slots.len() as u32 >= self.capacity
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Iterate over live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (HandleId, &Record)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    HandleId {
                        index: index as u16,
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }
}
