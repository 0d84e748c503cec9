//! Transport adapters: the narrow contract the channel and acquisition loop
//! use to move bytes to and from the foil controller.

pub mod replay;
pub mod scripted;
#[cfg(target_os = "linux")]
pub mod usbfs;
mod worker;

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferHandle(pub u64);

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final state of an asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// Cancelled on request.
    Cancelled,
    /// Unlinked because the device was reset or went away.
    Shutdown,
    /// The endpoint stalled.
    Stalled,
    /// Any other failure, with the adapter's error code.
    Fault(i32),
}

impl TransferStatus {
    /// Statuses produced by deliberate cancellation; never reported to callers.
    pub fn is_cancellation(self) -> bool {
        matches!(self, TransferStatus::Cancelled | TransferStatus::Shutdown)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
            TransferStatus::Shutdown => write!(f, "shutdown"),
            TransferStatus::Stalled => write!(f, "stalled"),
            TransferStatus::Fault(code) => write!(f, "fault {}", code),
        }
    }
}

/// Delivered once per submitted transfer. The buffer is handed back so the
/// owner can reuse or free it.
#[derive(Debug)]
pub struct Completion {
    pub handle: TransferHandle,
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    pub actual_len: usize,
}

/// Completion callback. Runs on the adapter's context and must not block.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("out of memory")]
    NoMemory,

    #[error("device is gone")]
    Disconnected,

    #[error("no {0} endpoint bound")]
    NoEndpoint(&'static str),

    #[error("transfer timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub bulk_in: Option<u8>,
    pub bulk_out: Option<u8>,
}

pub trait Transport: Send + Sync + 'static {
    fn endpoints(&self) -> Endpoints;

    /// Start a bulk-in transfer of at most `max_len` bytes into `buffer`.
    fn submit_read(
        &self,
        buffer: Vec<u8>,
        max_len: usize,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError>;

    /// Start a bulk-out transfer carrying all of `buffer`.
    fn submit_write(
        &self,
        buffer: Vec<u8>,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError>;

    /// Request cancellation. The completion still fires, with a cancellation
    /// status unless the transfer had already finished.
    fn cancel(&self, handle: TransferHandle);

    /// Synchronous bulk-in read used by the acquisition loop.
    fn bulk_read(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
}
