//! Counting admission gate bounding concurrent write transfers.

use super::Interrupt;
use crate::error::{ChannelError, ChannelResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct Slots {
    free: usize,
    closed: bool,
}

pub struct AdmissionGate {
    slots: Mutex<Slots>,
    released: Condvar,
    capacity: usize,
}

/// One admitted slot. Dropping it returns the slot to the gate.
pub struct Permit {
    gate: Arc<AdmissionGate>,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Slots {
                free: capacity,
                closed: false,
            }),
            released: Condvar::new(),
            capacity,
        })
    }

    pub fn available(&self) -> usize {
        self.slots.lock().free
    }

    /// Fails with `WouldBlock` when no slot is free, `DeviceAbsent` once closed.
    pub fn try_acquire(self: &Arc<Self>) -> ChannelResult<Permit> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(ChannelError::DeviceAbsent);
        }
        if slots.free == 0 {
            return Err(ChannelError::WouldBlock);
        }
        slots.free -= 1;
        Ok(Permit {
            gate: Arc::clone(self),
        })
    }

    /// Wait for a slot; fails with `Interrupted` if `interrupt` fires first
    /// and with `DeviceAbsent` if the gate is closed meanwhile.
    pub fn acquire(self: &Arc<Self>, interrupt: &Interrupt) -> ChannelResult<Permit> {
        let mut slots = self.slots.lock();
        loop {
            if slots.closed {
                return Err(ChannelError::DeviceAbsent);
            }
            if slots.free > 0 {
                break;
            }
            if interrupt.take() {
                return Err(ChannelError::Interrupted);
            }
            self.released.wait(&mut slots);
        }
        slots.free -= 1;
        Ok(Permit {
            gate: Arc::clone(self),
        })
    }

    /// Refuse all further admissions and release every waiter. Permits still
    /// held elsewhere may never come back.
    pub fn close(&self) {
        self.slots.lock().closed = true;
        self.released.notify_all();
    }

    /// Wake waiters so they can observe an interrupt.
    pub fn wake_all(&self) {
        drop(self.slots.lock());
        self.released.notify_all();
    }

    fn release(&self) {
        let mut slots = self.slots.lock();
        slots.free += 1;
        debug_assert!(slots.free <= self.capacity);
        drop(slots);
        self.released.notify_one();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
