//! Replays a raw capture file as if it were the foil's bulk-in stream.
//!
//! The file is treated as one endless byte stream: reads continue where the
//! previous one stopped and wrap at the end. Writes are accepted and dropped.

use super::worker::{sleep_unless_cancelled, TransferTable};
use super::{
    CompletionFn, Endpoints, TransferHandle, TransferStatus, Transport, TransportError,
};
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const REPLAY_IN_ENDPOINT: u8 = 0x81;
const REPLAY_OUT_ENDPOINT: u8 = 0x01;

pub struct ReplayTransport {
    data: Vec<u8>,
    cursor: Mutex<usize>,
    /// Delay applied to each asynchronous transfer, mimicking bus latency.
    pace: Duration,
    table: Arc<TransferTable>,
}

impl ReplayTransport {
    pub fn open(path: &Path, pace: Duration) -> io::Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data, pace)
    }

    pub fn from_bytes(data: Vec<u8>, pace: Duration) -> io::Result<Self> {
        if data.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "capture file is empty",
            ));
        }
        Ok(Self {
            data,
            cursor: Mutex::new(0),
            pace,
            table: TransferTable::new("replay"),
        })
    }

    /// Copy the next `dst.len()` bytes of the stream, wrapping at the end.
    fn take(&self, dst: &mut [u8]) {
        take_wrapping(&self.data, &mut self.cursor.lock(), dst);
    }
}

fn take_wrapping(data: &[u8], cursor: &mut usize, dst: &mut [u8]) {
    let mut filled = 0;
    while filled < dst.len() {
        let run = (data.len() - *cursor).min(dst.len() - filled);
        dst[filled..filled + run].copy_from_slice(&data[*cursor..*cursor + run]);
        filled += run;
        *cursor = (*cursor + run) % data.len();
    }
}

impl Transport for ReplayTransport {
    fn endpoints(&self) -> Endpoints {
        Endpoints {
            bulk_in: Some(REPLAY_IN_ENDPOINT),
            bulk_out: Some(REPLAY_OUT_ENDPOINT),
        }
    }

    fn submit_read(
        &self,
        mut buffer: Vec<u8>,
        max_len: usize,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError> {
        let len = max_len.min(buffer.len());
        // Reserve the bytes now so transfers complete in submission order.
        self.take(&mut buffer[..len]);
        let pace = self.pace;
        self.table.spawn(
            move |cancelled| {
                if sleep_unless_cancelled(pace, cancelled) {
                    (TransferStatus::Completed, buffer, len)
                } else {
                    (TransferStatus::Cancelled, buffer, 0)
                }
            },
            on_complete,
        )
    }

    fn submit_write(
        &self,
        buffer: Vec<u8>,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError> {
        let pace = self.pace;
        self.table.spawn(
            move |cancelled| {
                if sleep_unless_cancelled(pace, cancelled) {
                    log::debug!("replay: discarding {} written bytes", buffer.len());
                    let len = buffer.len();
                    (TransferStatus::Completed, buffer, len)
                } else {
                    (TransferStatus::Cancelled, buffer, 0)
                }
            },
            on_complete,
        )
    }

    fn cancel(&self, handle: TransferHandle) {
        self.table.cancel(handle);
    }

    fn bulk_read(&self, buffer: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.take(buffer);
        Ok(buffer.len())
    }
}

impl Drop for ReplayTransport {
    fn drop(&mut self) {
        self.table.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_stream_wraps_at_end() {
        let replay = ReplayTransport::from_bytes(vec![1, 2, 3, 4, 5], Duration::ZERO).unwrap();
        let mut buf = [0u8; 3];

        assert_eq!(replay.bulk_read(&mut buf, Duration::ZERO).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        replay.bulk_read(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(buf, [4, 5, 1]);
    }

    #[test]
    fn test_empty_capture_is_rejected() {
        assert!(ReplayTransport::from_bytes(Vec::new(), Duration::ZERO).is_err());
    }

    #[test]
    fn test_async_read_completes_with_data() {
        let replay = ReplayTransport::from_bytes(vec![7; 10], Duration::ZERO).unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = replay
            .submit_read(
                vec![0; 8],
                4,
                Box::new(move |done| {
                    let _ = tx.send(done);
                }),
            )
            .unwrap();

        let done = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(done.handle, handle);
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(done.actual_len, 4);
        assert_eq!(&done.buffer[..4], &[7, 7, 7, 7]);
    }

    #[test]
    fn test_cancelled_write_reports_cancellation() {
        let replay = ReplayTransport::from_bytes(vec![0], Duration::from_secs(30)).unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = replay
            .submit_write(
                vec![1, 2, 3],
                Box::new(move |done| {
                    let _ = tx.send(done.status);
                }),
            )
            .unwrap();
        replay.cancel(handle);

        let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, TransferStatus::Cancelled);
    }
}
