//! Flow control for the run loop.
//!
//! Two independent semaphores gate new deliveries: one permit per
//! in-flight message, and one permit per KiB of the memory budget. A
//! [`FlowPermit`] holds both and releases them on drop.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned when the governor's semaphores have been closed.
#[derive(Debug, thiserror::Error)]
#[error("flow control is closed")]
pub struct FlowClosed;

#[derive(Debug)]
pub struct FlowControl {
    slots: Arc<Semaphore>,
    memory: Arc<Semaphore>,
    max_in_flight: usize,
    budget_kib: u32,
    working_set_kib: u32,
}

/// Admission for one delivery.
#[derive(Debug)]
pub struct FlowPermit {
    _slot: OwnedSemaphorePermit,
    memory: Arc<Semaphore>,
    working_set: OwnedSemaphorePermit,
    payload: Option<OwnedSemaphorePermit>,
    budget_kib: u32,
}

fn to_kib(bytes: u64) -> u32 {
    u32::try_from(bytes.div_ceil(1024)).unwrap_or(u32::MAX)
}

impl FlowControl {
    /// `working_set_bytes` is reserved for every admitted delivery and is
    /// clamped to the budget.
    pub fn new(max_in_flight: usize, memory_budget_bytes: u64, working_set_bytes: u64) -> Self {
        let budget_kib = to_kib(memory_budget_bytes).max(1);
        let working_set_kib = to_kib(working_set_bytes).min(budget_kib);
        Self {
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
            memory: Arc::new(Semaphore::new(budget_kib as usize)),
            max_in_flight: max_in_flight.max(1),
            budget_kib,
            working_set_kib,
        }
    }

    /// Wait for a free slot and the working-set reservation.
    pub async fn acquire_slot(&self) -> Result<FlowPermit, FlowClosed> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| FlowClosed)?;
        let working_set = Arc::clone(&self.memory)
            .acquire_many_owned(self.working_set_kib)
            .await
            .map_err(|_| FlowClosed)?;
        Ok(self.permit(slot, working_set))
    }

    /// Admit a delivery only if both bounds have room right now.
    pub fn try_acquire_slot(&self) -> Option<FlowPermit> {
        let slot = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        let working_set = Arc::clone(&self.memory)
            .try_acquire_many_owned(self.working_set_kib)
            .ok()?;
        Some(self.permit(slot, working_set))
    }

    fn permit(&self, slot: OwnedSemaphorePermit, working_set: OwnedSemaphorePermit) -> FlowPermit {
        FlowPermit {
            _slot: slot,
            memory: Arc::clone(&self.memory),
            working_set,
            payload: None,
            budget_kib: self.budget_kib,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.slots.available_permits()
    }

    pub fn available_memory_kib(&self) -> usize {
        self.memory.available_permits()
    }

    /// Wake every waiter with [`FlowClosed`].
    pub fn close(&self) {
        self.slots.close();
        self.memory.close();
    }
}

impl FlowPermit {
    /// Reserve memory for the delivery's payload on top of the working
    /// set. A payload larger than what the budget can ever grant is
    /// clamped so the delivery can still run on its own.
    pub async fn reserve_payload(&mut self, bytes: usize) -> Result<(), FlowClosed> {
        let held = self.reserved_kib();
        let wanted = to_kib(bytes as u64).min(self.budget_kib - held);
        if wanted == 0 {
            return Ok(());
        }
        let permit = Arc::clone(&self.memory)
            .acquire_many_owned(wanted)
            .await
            .map_err(|_| FlowClosed)?;
        match self.payload.as_mut() {
            Some(existing) => existing.merge(permit),
            None => self.payload = Some(permit),
        }
        Ok(())
    }

    pub fn reserved_kib(&self) -> u32 {
        let payload = self.payload.as_ref().map_or(0, |p| p.num_permits());
        (self.working_set.num_permits() + payload) as u32
    }
}
