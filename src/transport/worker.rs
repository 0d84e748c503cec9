use super::{Completion, CompletionFn, TransferHandle, TransferStatus, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Outcome of a transfer job: status, the buffer handed back, bytes moved.
pub(crate) type JobOutcome = (TransferStatus, Vec<u8>, usize);

/// Runs blocking transfer jobs on their own threads and tracks a cancel flag
/// per live transfer.
pub(crate) struct TransferTable {
    name: &'static str,
    next: AtomicU64,
    live: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl TransferTable {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            next: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        })
    }

    pub fn spawn<F>(
        self: &Arc<Self>,
        job: F,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError>
    where
        F: FnOnce(&AtomicBool) -> JobOutcome + Send + 'static,
    {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.live.lock().insert(id, Arc::clone(&cancelled));

        let table = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-xfer-{}", self.name, id))
            .spawn(move || {
                let (status, buffer, actual_len) = job(&cancelled);
                table.live.lock().remove(&id);
                on_complete(Completion {
                    handle: TransferHandle(id),
                    status,
                    buffer,
                    actual_len,
                });
            });

        match spawned {
            Ok(_) => Ok(TransferHandle(id)),
            Err(e) => {
                self.live.lock().remove(&id);
                Err(TransportError::Io(e))
            }
        }
    }

    pub fn cancel(&self, handle: TransferHandle) {
        if let Some(flag) = self.live.lock().get(&handle.0) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn cancel_all(&self) {
        for flag in self.live.lock().values() {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Sleep for `duration` unless `cancelled` is raised first. Returns `false`
/// when cancelled.
pub(crate) fn sleep_unless_cancelled(duration: Duration, cancelled: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancelled.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}
