//! Shared table of jobs currently out on hardware.
//!
//! The Stratum client installs jobs as the pool sends them; the result
//! pipeline looks them up when a nonce comes back. Hardware reports results
//! tagged with a small job handle, so the table is a fixed array indexed by
//! that handle, as on the chips themselves.
//!
//! Invalidation is O(1): the table carries a generation number and each slot
//! remembers the generation it was installed in. Bumping the table
//! generation retires every slot at once, without touching them.
//!
//! The lock is held only long enough to copy or replace one slot. Callers
//! never see references into the table; [`JobTable::snapshot`] hands back an
//! owned copy that stays valid however the table changes afterwards.

use parking_lot::Mutex;
use thiserror::Error;

use crate::stratum_v1::MiningJob;
use crate::types::Extranonce2;

/// Handle hardware uses to refer to a job.
pub type JobHandle = u8;

/// Largest table the handle type can address.
pub const MAX_SLOTS: usize = JobHandle::MAX as usize + 1;

/// Default slot count.
pub const DEFAULT_SLOTS: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobTableError {
    #[error("Job handle {handle} outside table of {capacity} slots")]
    HandleOutOfRange { handle: JobHandle, capacity: usize },
}

/// A job as dispatched to hardware, with everything needed to rebuild the
/// header a chip hashed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveJob {
    pub job: MiningJob,
    pub extranonce1: Vec<u8>,
    pub extranonce2: Extranonce2,

    /// Pool difficulty in effect when the job was issued
    pub pool_difficulty: f64,
}

#[derive(Debug, Default)]
struct Slot {
    job: Option<ActiveJob>,
    generation: u64,
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Slot>,
    generation: u64,
}

/// Fixed-capacity job table shared between the client and the pipeline.
#[derive(Debug)]
pub struct JobTable {
    inner: Mutex<Slots>,
}

impl JobTable {
    /// Create a table. Capacity is clamped to `1..=MAX_SLOTS`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_SLOTS);
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        Self {
            inner: Mutex::new(Slots {
                slots,
                // Start above the zero every empty slot carries
                generation: 1,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Install a job, replacing whatever the slot held.
    pub fn install(&self, handle: JobHandle, job: ActiveJob) -> Result<(), JobTableError> {
        let old = {
            let mut inner = self.inner.lock();
            let generation = inner.generation;
            let capacity = inner.slots.len();
            let slot = inner
                .slots
                .get_mut(handle as usize)
                .ok_or(JobTableError::HandleOutOfRange { handle, capacity })?;
            slot.generation = generation;
            slot.job.replace(job)
        };
        // Displaced job dropped outside the lock
        drop(old);
        Ok(())
    }

    /// Mark every slot invalid.
    pub fn invalidate_all(&self) {
        self.inner.lock().generation += 1;
    }

    /// Copy out the job at `handle` if it is still valid.
    pub fn snapshot(&self, handle: JobHandle) -> Option<ActiveJob> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(handle as usize)?;
        if slot.generation != inner.generation {
            return None;
        }
        slot.job.clone()
    }

    /// Number of slots holding a valid job.
    pub fn valid_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|slot| slot.job.is_some() && slot.generation == inner.generation)
            .count()
    }
}

/// Hands out job handles round-robin across the table.
#[derive(Debug, Clone)]
pub struct HandleAllocator {
    next: usize,
    capacity: usize,
}

impl HandleAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: 0,
            capacity: capacity.clamp(1, MAX_SLOTS),
        }
    }

    pub fn next_handle(&mut self) -> JobHandle {
        let handle = self.next as JobHandle;
        self.next = (self.next + 1) % self.capacity;
        handle
    }
}
