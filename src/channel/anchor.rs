//! Registry of a session's outstanding write transfers, so teardown can find
//! and cancel them.

use crate::transport::TransferHandle;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnchorToken(u64);

#[derive(Default)]
struct Entries {
    next: u64,
    // Handle is `None` between reservation and a successful submit.
    live: HashMap<u64, Option<TransferHandle>>,
}

#[derive(Default)]
pub struct Anchor {
    entries: Mutex<Entries>,
    emptied: Condvar,
}

impl Anchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self) -> AnchorToken {
        let mut entries = self.entries.lock();
        entries.next += 1;
        let id = entries.next;
        entries.live.insert(id, None);
        AnchorToken(id)
    }

    pub fn bind(&self, token: AnchorToken, handle: TransferHandle) {
        if let Some(slot) = self.entries.lock().live.get_mut(&token.0) {
            *slot = Some(handle);
        }
    }

    /// Remove an entry. Unknown tokens (already abandoned) are ignored.
    pub fn release(&self, token: AnchorToken) {
        let mut entries = self.entries.lock();
        if entries.live.remove(&token.0).is_some() && entries.live.is_empty() {
            drop(entries);
            self.emptied.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles of every submitted transfer still outstanding.
    pub fn handles(&self) -> Vec<TransferHandle> {
        self.entries.lock().live.values().flatten().copied().collect()
    }

    /// Wait until no transfers remain. Returns `false` on timeout.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        while !entries.live.is_empty() {
            if self.emptied.wait_until(&mut entries, deadline).timed_out() {
                return entries.live.is_empty();
            }
        }
        true
    }

    /// Forget every remaining entry; late completions become no-ops.
    pub fn abandon(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.live.len();
        entries.live.clear();
        drop(entries);
        self.emptied.notify_all();
        count
    }
}
