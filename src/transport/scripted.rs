//! In-memory transport whose transfers complete only when the owner says so.
//!
//! Used to drive the channel through exact interleavings without a device.

use super::{
    Completion, CompletionFn, Endpoints, TransferHandle, TransferStatus, Transport,
    TransportError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

struct PendingTransfer {
    handle: TransferHandle,
    buffer: Vec<u8>,
    max_len: usize,
    on_complete: CompletionFn,
}

#[derive(Default)]
struct ScriptState {
    next: u64,
    reads: VecDeque<PendingTransfer>,
    writes: VecDeque<PendingTransfer>,
    frames: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    cancelled: Vec<TransferHandle>,
    reads_submitted: usize,
    reject_submissions: bool,
    ignore_cancel: bool,
}

pub struct ScriptedTransport {
    endpoints: Endpoints,
    state: Mutex<ScriptState>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::with_endpoints(Endpoints {
            bulk_in: Some(0x81),
            bulk_out: Some(0x01),
        })
    }

    pub fn with_endpoints(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Queue a frame for the synchronous `bulk_read` path.
    pub fn push_frame(&self, frame: Vec<u8>) {
        self.state.lock().frames.push_back(frame);
    }

    /// Make subsequent submissions fail with `NoMemory`.
    pub fn reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submissions = reject;
    }

    /// Record cancellations but leave the transfers outstanding, like a
    /// device that has stopped responding.
    pub fn ignore_cancel(&self, ignore: bool) {
        self.state.lock().ignore_cancel = ignore;
    }

    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Total read transfers ever accepted.
    pub fn reads_submitted(&self) -> usize {
        self.state.lock().reads_submitted
    }

    /// `max_len` of the oldest outstanding read.
    pub fn pending_read_len(&self) -> Option<usize> {
        self.state.lock().reads.front().map(|t| t.max_len)
    }

    /// Payloads of successfully completed writes, oldest first.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn cancelled(&self) -> Vec<TransferHandle> {
        self.state.lock().cancelled.clone()
    }

    /// Complete the oldest read with `data`, truncated to the requested length.
    pub fn complete_read(&self, data: &[u8]) -> bool {
        let Some(mut transfer) = self.state.lock().reads.pop_front() else {
            return false;
        };
        let len = data.len().min(transfer.max_len).min(transfer.buffer.len());
        transfer.buffer[..len].copy_from_slice(&data[..len]);
        finish(transfer, TransferStatus::Completed, len);
        true
    }

    /// Fail the oldest read with `status`.
    pub fn fail_read(&self, status: TransferStatus) -> bool {
        let Some(transfer) = self.state.lock().reads.pop_front() else {
            return false;
        };
        finish(transfer, status, 0);
        true
    }

    /// Finish the oldest write with `status`.
    pub fn complete_write(&self, status: TransferStatus) -> bool {
        let Some(transfer) = self.state.lock().writes.pop_front() else {
            return false;
        };
        let len = transfer.buffer.len();
        if status == TransferStatus::Completed {
            self.state.lock().written.push(transfer.buffer.clone());
        }
        finish(transfer, status, len);
        true
    }

    fn enqueue(
        &self,
        buffer: Vec<u8>,
        max_len: usize,
        on_complete: CompletionFn,
        read: bool,
    ) -> Result<TransferHandle, TransportError> {
        let mut state = self.state.lock();
        if state.reject_submissions {
            return Err(TransportError::NoMemory);
        }
        state.next += 1;
        let handle = TransferHandle(state.next);
        let transfer = PendingTransfer {
            handle,
            buffer,
            max_len,
            on_complete,
        };
        if read {
            state.reads_submitted += 1;
            state.reads.push_back(transfer);
        } else {
            state.writes.push_back(transfer);
        }
        Ok(handle)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn finish(transfer: PendingTransfer, status: TransferStatus, actual_len: usize) {
    (transfer.on_complete)(Completion {
        handle: transfer.handle,
        status,
        buffer: transfer.buffer,
        actual_len,
    });
}

impl Transport for ScriptedTransport {
    fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    fn submit_read(
        &self,
        buffer: Vec<u8>,
        max_len: usize,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError> {
        if self.endpoints.bulk_in.is_none() {
            return Err(TransportError::NoEndpoint("bulk-in"));
        }
        self.enqueue(buffer, max_len, on_complete, true)
    }

    fn submit_write(
        &self,
        buffer: Vec<u8>,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError> {
        if self.endpoints.bulk_out.is_none() {
            return Err(TransportError::NoEndpoint("bulk-out"));
        }
        let len = buffer.len();
        self.enqueue(buffer, len, on_complete, false)
    }

    fn cancel(&self, handle: TransferHandle) {
        let transfer = {
            let mut state = self.state.lock();
            state.cancelled.push(handle);
            if state.ignore_cancel {
                return;
            }
            let from_reads = state
                .reads
                .iter()
                .position(|t| t.handle == handle)
                .and_then(|i| state.reads.remove(i));
            match from_reads {
                Some(t) => Some(t),
                None => state
                    .writes
                    .iter()
                    .position(|t| t.handle == handle)
                    .and_then(|i| state.writes.remove(i)),
            }
        };
        // Completion runs outside the lock, as a real adapter's would.
        if let Some(transfer) = transfer {
            finish(transfer, TransferStatus::Cancelled, 0);
        }
    }

    fn bulk_read(&self, buffer: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let frame = self
            .state
            .lock()
            .frames
            .pop_front()
            .ok_or(TransportError::TimedOut)?;
        let len = frame.len().min(buffer.len());
        buffer[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }
}
