//! Single-slot, newest-wins handoff between differently clocked tasks.
//!
//! A `Mailbox` holds at most one value. Writers overwrite unconditionally,
//! readers take a shared snapshot (`Arc<T>`) without removing it. Neither side
//! waits on the other beyond the few instructions it takes to swap the `Arc`.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct Mailbox<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Replace the stored value. Any previous value is dropped once its
    /// last reader lets go of it.
    pub fn publish(&self, value: Arc<T>) -> Result<()> {
        *self.guard()? = Some(value);
        Ok(())
    }

    /// Latest published value, or `None` if nothing was published yet.
    pub fn latest(&self) -> Result<Option<Arc<T>>> {
        Ok(self.guard()?.clone())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.guard()?.is_none())
    }

    fn guard(&self) -> Result<MutexGuard<'_, Option<Arc<T>>>> {
        self.slot
            .lock()
            .map_err(|_| anyhow!("mailbox lock poisoned"))
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
