//! Buffered, reference-counted byte-stream channel over a transport.
//!
//! A [`Session`] owns one attached device. Each open [`Handle`] holds a
//! reference to it, as does every transfer still in flight and the
//! acquisition loop; the session is freed when the last one lets go.
//!
//! Locking: `io` is the long-held lock that serialises read/write entry
//! against teardown. `state` is the short-held lock shared with completion
//! callbacks; it guards the read state machine, the residual buffer and the
//! pending error. `state` is never held while taking `io`, and no transport
//! method is called with `state` held.

pub mod anchor;
pub mod gate;

use crate::calibration::Engine;
use crate::config::ChannelSettings;
use crate::error::{ChannelError, ChannelResult};
use crate::transport::{
    Completion, Endpoints, TransferHandle, TransferStatus, Transport, TransportError,
};
use anchor::{Anchor, AnchorToken};
use gate::AdmissionGate;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How often a caller blocked on the I/O lock checks for an interrupt.
const IO_LOCK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Blocking,
    NonBlocking,
}

/// Per-handle interrupt flag. A raised flag aborts the next blocking wait.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume a raised interrupt.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Idle,
    /// Handle is `None` until the transport accepted the submission.
    Pending(Option<TransferHandle>),
}

impl ReadState {
    fn is_pending(self) -> bool {
        matches!(self, ReadState::Pending(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingError {
    Reset,
    Failed(TransferStatus),
}

impl PendingError {
    fn from_status(status: TransferStatus) -> Self {
        match status {
            TransferStatus::Stalled => PendingError::Reset,
            other => PendingError::Failed(other),
        }
    }
}

impl From<PendingError> for ChannelError {
    fn from(err: PendingError) -> Self {
        match err {
            PendingError::Reset => ChannelError::TransportReset,
            PendingError::Failed(_) => ChannelError::Io,
        }
    }
}

struct TransferState {
    read: ReadState,
    /// Bulk-in buffer; lent to the transport while a read is pending.
    buffer: Option<Vec<u8>>,
    filled: usize,
    copied: usize,
    error: Option<PendingError>,
    /// Reads given up on whose completions may still arrive.
    abandoned: Vec<TransferHandle>,
    /// A read was given up on before its submission returned a handle.
    abandoned_unbound: bool,
}

struct IoState {
    attached: bool,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub read_pending: bool,
    pub buffered: usize,
    pub writes_in_flight: usize,
    pub free_write_slots: usize,
}

pub struct Session {
    name: String,
    settings: ChannelSettings,
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    io: Mutex<IoState>,
    state: Mutex<TransferState>,
    read_done: Condvar,
    gate: Arc<AdmissionGate>,
    anchor: Anchor,
    engine: Mutex<Engine>,
}

impl Session {
    pub fn attach(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        settings: ChannelSettings,
        engine: Engine,
    ) -> Arc<Self> {
        let name = name.into();
        let endpoints = transport.endpoints();
        log::info!(
            "{}: attached (bulk-in {:?}, bulk-out {:?}, {} writes in flight)",
            name,
            endpoints.bulk_in,
            endpoints.bulk_out,
            settings.writes_in_flight
        );
        Arc::new(Self {
            name,
            settings,
            endpoints,
            transport,
            io: Mutex::new(IoState { attached: true }),
            state: Mutex::new(TransferState {
                read: ReadState::Idle,
                buffer: Some(vec![0; settings.bulk_in_size]),
                filled: 0,
                copied: 0,
                error: None,
                abandoned: Vec::new(),
                abandoned_unbound: false,
            }),
            read_done: Condvar::new(),
            gate: AdmissionGate::new(settings.writes_in_flight),
            anchor: Anchor::new(),
            engine: Mutex::new(engine),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn is_attached(&self) -> bool {
        self.io.lock().attached
    }

    pub fn open(self: &Arc<Self>) -> ChannelResult<Handle> {
        if !self.is_attached() {
            return Err(ChannelError::DeviceAbsent);
        }
        log::debug!("{}: handle opened", self.name);
        Ok(Handle {
            session: Arc::clone(self),
            interrupt: Interrupt::default(),
        })
    }

    /// Calibration state lives with the session; only the acquisition loop
    /// mutates it.
    pub fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock()
    }

    pub fn stats(&self) -> ChannelStats {
        let st = self.state.lock();
        ChannelStats {
            read_pending: st.read.is_pending(),
            buffered: st.filled - st.copied,
            writes_in_flight: self.anchor.len(),
            free_write_slots: self.gate.available(),
        }
    }

    /// Synchronous frame fetch for the acquisition loop. Bypasses the
    /// residual buffer entirely.
    pub fn acquire_frame(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if !self.is_attached() {
            return Err(TransportError::Disconnected);
        }
        self.transport.bulk_read(buf, timeout)
    }

    fn lock_io(&self, interrupt: &Interrupt) -> ChannelResult<MutexGuard<'_, IoState>> {
        loop {
            if let Some(guard) = self.io.try_lock_for(IO_LOCK_POLL) {
                return Ok(guard);
            }
            if interrupt.take() {
                return Err(ChannelError::Interrupted);
            }
        }
    }

    fn read_into(
        self: &Arc<Self>,
        dst: &mut [u8],
        count: usize,
        mode: IoMode,
        interrupt: &Interrupt,
    ) -> ChannelResult<usize> {
        // Nothing to read from: end of stream.
        if count == 0 || self.endpoints.bulk_in.is_none() {
            return Ok(0);
        }
        if dst.len() < count.min(self.settings.bulk_in_size) {
            return Err(ChannelError::BadAddress);
        }

        let mut io = self.lock_io(interrupt)?;
        loop {
            if !io.attached {
                return Err(ChannelError::DeviceAbsent);
            }

            let mut st = self.state.lock();
            if st.read.is_pending() {
                if mode == IoMode::NonBlocking {
                    return Err(ChannelError::WouldBlock);
                }
                // Let teardown proceed while we wait for the transfer.
                drop(io);
                while st.read.is_pending() {
                    if interrupt.take() {
                        return Err(ChannelError::Interrupted);
                    }
                    self.read_done.wait(&mut st);
                }
                drop(st);
                io = self.lock_io(interrupt)?;
                continue;
            }

            if let Some(err) = st.error.take() {
                return Err(err.into());
            }

            let available = st.filled - st.copied;
            if available == 0 {
                drop(st);
                self.start_read(count)?;
                continue;
            }

            let chunk = available.min(count);
            let copied = st.copied;
            match st.buffer.as_deref() {
                Some(buffer) => dst[..chunk].copy_from_slice(&buffer[copied..copied + chunk]),
                None => {
                    // Buffer was abandoned with its transfer; start over.
                    st.filled = 0;
                    st.copied = 0;
                    drop(st);
                    self.start_read(count)?;
                    continue;
                }
            }
            st.copied += chunk;
            drop(st);

            // Asked for more than we had: prefetch, but don't wait.
            if available < count {
                if let Err(e) = self.start_read(count - chunk) {
                    log::debug!("{}: prefetch not started: {}", self.name, e);
                }
            }
            return Ok(chunk);
        }
    }

    /// Submit the bulk-in transfer. Caller holds the I/O lock.
    fn start_read(self: &Arc<Self>, count: usize) -> ChannelResult<()> {
        let len = self.settings.bulk_in_size.min(count);
        let buffer = {
            let mut st = self.state.lock();
            st.read = ReadState::Pending(None);
            st.filled = 0;
            st.copied = 0;
            st.buffer.take()
        };
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => match alloc_buffer(self.settings.bulk_in_size) {
                Ok(buffer) => buffer,
                Err(e) => {
                    self.set_read_idle();
                    return Err(e);
                }
            },
        };

        let session = Arc::clone(self);
        let submitted = self.transport.submit_read(
            buffer,
            len,
            Box::new(move |done| session.read_complete(done)),
        );

        match submitted {
            Ok(handle) => {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                if let ReadState::Pending(slot @ None) = &mut st.read {
                    *slot = Some(handle);
                } else if st.abandoned_unbound {
                    st.abandoned_unbound = false;
                    st.abandoned.push(handle);
                }
                log::trace!("{}: read {} submitted for {} bytes", self.name, handle, len);
                Ok(())
            }
            Err(e) => {
                log::error!("{}: failed submitting read transfer: {}", self.name, e);
                self.set_read_idle();
                Err(match e {
                    TransportError::NoMemory => ChannelError::OutOfMemory,
                    _ => ChannelError::Io,
                })
            }
        }
    }

    fn set_read_idle(&self) {
        self.state.lock().read = ReadState::Idle;
        self.read_done.notify_all();
    }

    fn read_complete(&self, done: Completion) {
        let mut st = self.state.lock();
        if let Some(i) = st.abandoned.iter().position(|&h| h == done.handle) {
            st.abandoned.swap_remove(i);
            log::debug!("{}: late completion for abandoned read {}", self.name, done.handle);
            if st.buffer.is_none() && !st.read.is_pending() {
                st.buffer = Some(done.buffer);
            }
            return;
        }
        let current = match st.read {
            ReadState::Pending(None) => true,
            ReadState::Pending(Some(handle)) => handle == done.handle,
            ReadState::Idle => false,
        };
        if !current {
            log::debug!("{}: late completion for abandoned read {}", self.name, done.handle);
            if st.buffer.is_none() && !st.read.is_pending() {
                st.buffer = Some(done.buffer);
            }
            return;
        }

        match done.status {
            TransferStatus::Completed => st.filled = done.actual_len.min(done.buffer.len()),
            status if status.is_cancellation() => {
                log::debug!("{}: read {} {}", self.name, done.handle, status);
            }
            status => {
                log::error!(
                    "{}: nonzero read bulk status received: {}",
                    self.name,
                    status
                );
                st.error = Some(PendingError::from_status(status));
            }
        }
        st.buffer = Some(done.buffer);
        st.read = ReadState::Idle;
        drop(st);
        self.read_done.notify_all();
    }

    fn write(
        self: &Arc<Self>,
        data: &[u8],
        mode: IoMode,
        interrupt: &Interrupt,
    ) -> ChannelResult<usize> {
        if data.is_empty() || self.endpoints.bulk_out.is_none() {
            return Ok(0);
        }
        let size = data.len().min(self.settings.max_transfer);

        // Bound the number of buffers a writer can pin.
        let permit = match mode {
            IoMode::Blocking => self.gate.acquire(interrupt)?,
            IoMode::NonBlocking => self.gate.try_acquire()?,
        };

        if let Some(err) = self.state.lock().error.take() {
            return Err(err.into());
        }

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|_| ChannelError::OutOfMemory)?;
        buffer.extend_from_slice(&data[..size]);

        // Never submit to a device that is going away.
        let io = self.io.lock();
        if !io.attached {
            return Err(ChannelError::DeviceAbsent);
        }
        let token = self.anchor.reserve();
        let session = Arc::clone(self);
        let submitted = self.transport.submit_write(
            buffer,
            Box::new(move |done| {
                session.write_complete(token, done);
                drop(permit);
            }),
        );
        drop(io);

        match submitted {
            Ok(handle) => {
                self.anchor.bind(token, handle);
                log::trace!("{}: write {} submitted, {} bytes", self.name, handle, size);
                Ok(size)
            }
            Err(e) => {
                log::error!("{}: failed submitting write transfer: {}", self.name, e);
                self.anchor.release(token);
                Err(match e {
                    TransportError::NoMemory => ChannelError::OutOfMemory,
                    TransportError::Disconnected => ChannelError::DeviceAbsent,
                    _ => ChannelError::Io,
                })
            }
        }
    }

    fn write_complete(&self, token: AnchorToken, done: Completion) {
        match done.status {
            TransferStatus::Completed => {}
            status if status.is_cancellation() => {
                log::debug!("{}: write {} {}", self.name, done.handle, status);
            }
            status => {
                log::error!(
                    "{}: nonzero write bulk status received: {}",
                    self.name,
                    status
                );
                self.state.lock().error = Some(PendingError::from_status(status));
            }
        }
        self.anchor.release(token);
    }

    /// Wait for outstanding I/O to stop, then report and clear any pending
    /// error.
    pub fn flush(&self) -> ChannelResult<()> {
        let io = self.io.lock();
        self.draw_down();
        let err = self.state.lock().error.take();
        drop(io);
        match err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Cancel every outstanding transfer and wait for quiescence. Transfers
    /// that do not settle within the drain timeout are abandoned.
    pub fn cancel_all(&self) {
        self.kill_writes();
        self.kill_read();
    }

    fn draw_down(&self) {
        if !self.anchor.wait_empty(self.settings.drain_timeout) {
            log::warn!(
                "{}: {} writes still in flight after {:?}, cancelling",
                self.name,
                self.anchor.len(),
                self.settings.drain_timeout
            );
            self.kill_writes();
        }
        self.kill_read();
    }

    fn kill_writes(&self) {
        for handle in self.anchor.handles() {
            self.transport.cancel(handle);
        }
        if !self.anchor.wait_empty(self.settings.drain_timeout) {
            let abandoned = self.anchor.abandon();
            log::warn!(
                "{}: abandoned {} write transfers that ignored cancellation",
                self.name,
                abandoned
            );
        }
    }

    fn kill_read(&self) {
        let pending = self.state.lock().read;
        let ReadState::Pending(handle) = pending else {
            return;
        };
        if let Some(handle) = handle {
            self.transport.cancel(handle);
        }

        let deadline = Instant::now() + self.settings.drain_timeout;
        let mut st = self.state.lock();
        while st.read.is_pending() {
            if self.read_done.wait_until(&mut st, deadline).timed_out() {
                if let ReadState::Pending(handle) = st.read {
                    log::warn!("{}: abandoning read that ignored cancellation", self.name);
                    match handle {
                        Some(handle) => st.abandoned.push(handle),
                        None => st.abandoned_unbound = true,
                    }
                    st.read = ReadState::Idle;
                    st.filled = 0;
                    st.copied = 0;
                }
                break;
            }
        }
        drop(st);
        self.read_done.notify_all();
    }

    /// Mark the device gone and retract everything in flight. Callers still
    /// inside read/write observe `DeviceAbsent`.
    pub fn disconnect(&self) {
        {
            let mut io = self.io.lock();
            if !io.attached {
                return;
            }
            io.attached = false;
        }
        self.gate.close();
        self.cancel_all();
        self.wake_waiters();
        log::info!("{}: now disconnected", self.name);
    }

    /// Quiesce I/O ahead of a transport reset. The I/O lock stays held until
    /// the guard drops, at which point readers and writers are told about the
    /// reset once.
    pub fn begin_reset(&self) -> ResetGuard<'_> {
        let io = self.io.lock();
        self.draw_down();
        log::info!("{}: transport reset in progress", self.name);
        ResetGuard {
            session: self,
            _io: io,
        }
    }

    fn wake_waiters(&self) {
        drop(self.state.lock());
        self.read_done.notify_all();
        self.gate.wake_all();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::debug!("{}: last reference released", self.name);
    }
}

pub struct ResetGuard<'a> {
    session: &'a Session,
    _io: MutexGuard<'a, IoState>,
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        // No transfers are active here; the I/O lock is still held.
        self.session.state.lock().error = Some(PendingError::Reset);
        log::info!("{}: transport reset complete", self.session.name);
    }
}

fn alloc_buffer(len: usize) -> ChannelResult<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| ChannelError::OutOfMemory)?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// An open user handle on the byte stream.
pub struct Handle {
    session: Arc<Session>,
    interrupt: Interrupt,
}

impl Handle {
    /// Read up to `count` bytes. An empty result means end of stream.
    pub fn read(&self, count: usize, mode: IoMode) -> ChannelResult<Vec<u8>> {
        let mut buf = alloc_buffer(count.min(self.session.settings.bulk_in_size))?;
        let n = self
            .session
            .read_into(&mut buf, count, mode, &self.interrupt)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read into `dst`, which must hold `min(count, bulk_in_size)` bytes.
    pub fn read_into(&self, dst: &mut [u8], count: usize, mode: IoMode) -> ChannelResult<usize> {
        self.session.read_into(dst, count, mode, &self.interrupt)
    }

    /// Queue one transfer of at most `max_transfer` bytes; returns how many
    /// bytes were accepted.
    pub fn write(&self, data: &[u8], mode: IoMode) -> ChannelResult<usize> {
        self.session.write(data, mode, &self.interrupt)
    }

    pub fn flush(&self) -> ChannelResult<()> {
        self.session.flush()
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            interrupt: self.interrupt.clone(),
            session: Arc::downgrade(&self.session),
        }
    }

}

impl Drop for Handle {
    fn drop(&mut self) {
        log::debug!("{}: handle closed", self.session.name);
    }
}

/// `read_exact`, `read_to_end` and `write_all` retry on
/// `ErrorKind::Interrupted`, which would swallow a raised interrupt; it is
/// reported as `Other` wrapping `ChannelError::Interrupted` instead.
fn stream_error(err: ChannelError) -> io::Error {
    match err {
        ChannelError::Interrupted => io::Error::other(err),
        other => other.into(),
    }
}

impl io::Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len();
        self.session
            .read_into(buf, count, IoMode::Blocking, &self.interrupt)
            .map_err(stream_error)
    }
}

impl io::Write for Handle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session
            .write(buf, IoMode::Blocking, &self.interrupt)
            .map_err(stream_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.flush().map_err(stream_error)
    }
}

/// Wakes a handle's blocked read or write from another thread.
#[derive(Clone)]
pub struct Interrupter {
    interrupt: Interrupt,
    session: Weak<Session>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.interrupt.raise();
        if let Some(session) = self.session.upgrade() {
            session.wake_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationSettings;
    use crate::transport::scripted::ScriptedTransport;
    use std::thread;

    fn settings() -> ChannelSettings {
        ChannelSettings {
            bulk_in_size: 16,
            max_transfer: 8,
            writes_in_flight: 2,
            drain_timeout: Duration::from_millis(50),
        }
    }

    fn setup_with(transport: ScriptedTransport) -> (Arc<ScriptedTransport>, Arc<Session>, Handle) {
        let transport = Arc::new(transport);
        let session = Session::attach(
            "test",
            transport.clone(),
            settings(),
            Engine::new(CalibrationSettings::default()),
        );
        let handle = session.open().unwrap();
        (transport, session, handle)
    }

    fn setup() -> (Arc<ScriptedTransport>, Arc<Session>, Handle) {
        setup_with(ScriptedTransport::new())
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_zero_count_read_starts_nothing() {
        let (transport, _session, handle) = setup();
        assert_eq!(handle.read(0, IoMode::NonBlocking), Ok(Vec::new()));
        assert_eq!(handle.read(0, IoMode::Blocking), Ok(Vec::new()));
        assert_eq!(transport.reads_submitted(), 0);
    }

    #[test]
    fn test_nonblocking_read_would_block_until_complete() {
        let (transport, _session, handle) = setup();

        assert_eq!(handle.read(8, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        assert_eq!(transport.pending_read_len(), Some(8));
        // Outstanding transfer: no second submission.
        assert_eq!(handle.read(8, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        assert_eq!(transport.reads_submitted(), 1);

        assert!(transport.complete_read(b"abcdefgh"));
        assert_eq!(handle.read(8, IoMode::NonBlocking), Ok(b"abcdefgh".to_vec()));
        assert_eq!(transport.reads_submitted(), 1);
    }

    #[test]
    fn test_short_residual_returns_data_and_prefetches() {
        let (transport, session, handle) = setup();

        assert_eq!(handle.read(16, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        let data: Vec<u8> = (1..=10).collect();
        assert!(transport.complete_read(&data));

        assert_eq!(handle.read(4, IoMode::NonBlocking), Ok(vec![1, 2, 3, 4]));
        assert_eq!(session.stats().buffered, 6);
        assert_eq!(transport.reads_submitted(), 1);

        assert_eq!(handle.read(16, IoMode::NonBlocking), Ok(vec![5, 6, 7, 8, 9, 10]));
        assert_eq!(transport.reads_submitted(), 2);
        assert_eq!(transport.pending_read_len(), Some(10));
        assert!(session.stats().read_pending);
    }

    #[test]
    fn test_blocking_read_waits_for_completion() {
        let (transport, _session, handle) = setup();
        let reader = thread::spawn(move || handle.read(4, IoMode::Blocking));

        wait_for(|| transport.pending_reads() == 1);
        assert!(transport.complete_read(b"wxyz"));
        assert_eq!(reader.join().unwrap(), Ok(b"wxyz".to_vec()));
    }

    #[test]
    fn test_transfer_error_reported_once() {
        let (transport, _session, handle) = setup();

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        assert!(transport.fail_read(TransferStatus::Stalled));
        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::TransportReset));
        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));

        assert!(transport.fail_read(TransferStatus::Fault(71)));
        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::Io));
        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
    }

    #[test]
    fn test_cancelled_read_is_absorbed() {
        let (transport, session, handle) = setup();

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        session.cancel_all();
        assert_eq!(transport.cancelled().len(), 1);
        assert!(!session.stats().read_pending);

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        assert_eq!(transport.reads_submitted(), 2);
    }

    #[test]
    fn test_read_into_rejects_small_destination() {
        let (transport, _session, handle) = setup();
        let mut dst = [0u8; 2];
        assert_eq!(
            handle.read_into(&mut dst, 4, IoMode::NonBlocking),
            Err(ChannelError::BadAddress)
        );
        assert_eq!(transport.reads_submitted(), 0);
    }

    #[test]
    fn test_missing_endpoints_mean_end_of_stream() {
        let (transport, _session, handle) = setup_with(ScriptedTransport::with_endpoints(
            Endpoints {
                bulk_in: None,
                bulk_out: None,
            },
        ));
        assert_eq!(handle.read(4, IoMode::Blocking), Ok(Vec::new()));
        assert_eq!(handle.write(b"abc", IoMode::Blocking), Ok(0));
        assert_eq!(transport.reads_submitted(), 0);
        assert_eq!(transport.pending_writes(), 0);
    }

    #[test]
    fn test_write_is_capped_at_max_transfer() {
        let (transport, session, handle) = setup();

        assert_eq!(handle.write(&[], IoMode::NonBlocking), Ok(0));
        assert_eq!(handle.write(&[7u8; 20], IoMode::NonBlocking), Ok(8));
        assert_eq!(session.stats().writes_in_flight, 1);

        assert!(transport.complete_write(TransferStatus::Completed));
        assert_eq!(transport.written(), vec![vec![7u8; 8]]);
        assert_eq!(session.stats().writes_in_flight, 0);
        assert_eq!(session.stats().free_write_slots, 2);
    }

    #[test]
    fn test_nonblocking_write_respects_gate() {
        let (transport, _session, handle) = setup();

        assert_eq!(handle.write(b"one", IoMode::NonBlocking), Ok(3));
        assert_eq!(handle.write(b"two", IoMode::NonBlocking), Ok(3));
        assert_eq!(handle.write(b"three", IoMode::NonBlocking), Err(ChannelError::WouldBlock));

        assert!(transport.complete_write(TransferStatus::Completed));
        assert_eq!(handle.write(b"three", IoMode::NonBlocking), Ok(5));
    }

    #[test]
    fn test_blocking_write_waits_for_slot() {
        let (transport, _session, handle) = setup();
        assert_eq!(handle.write(b"one", IoMode::Blocking), Ok(3));
        assert_eq!(handle.write(b"two", IoMode::Blocking), Ok(3));

        let writer = thread::spawn(move || handle.write(b"three", IoMode::Blocking));
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        assert_eq!(transport.pending_writes(), 2);

        assert!(transport.complete_write(TransferStatus::Completed));
        assert_eq!(writer.join().unwrap(), Ok(5));
        assert_eq!(transport.pending_writes(), 2);
    }

    #[test]
    fn test_write_failure_surfaces_on_next_write() {
        let (transport, _session, handle) = setup();

        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Ok(3));
        assert!(transport.complete_write(TransferStatus::Fault(5)));
        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Err(ChannelError::Io));
        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Ok(3));
    }

    #[test]
    fn test_cancelled_write_is_absorbed() {
        let (transport, session, handle) = setup();

        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Ok(3));
        session.cancel_all();
        assert_eq!(transport.cancelled().len(), 1);
        assert_eq!(session.stats().writes_in_flight, 0);
        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Ok(3));
    }

    #[test]
    fn test_flush_drains_and_reports_error_once() {
        let (transport, session, handle) = setup();

        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Ok(3));
        // Never completed by the device: flush cancels it after the drain timeout.
        assert_eq!(handle.flush(), Ok(()));
        assert_eq!(session.stats().writes_in_flight, 0);
        assert_eq!(transport.cancelled().len(), 1);

        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Ok(3));
        assert!(transport.complete_write(TransferStatus::Stalled));
        assert_eq!(handle.flush(), Err(ChannelError::TransportReset));
        assert_eq!(handle.flush(), Ok(()));
    }

    #[test]
    fn test_disconnect_fails_io_and_cancels_transfers() {
        let (transport, session, handle) = setup();

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Ok(3));
        session.disconnect();

        assert_eq!(transport.cancelled().len(), 2);
        assert_eq!(transport.pending_reads(), 0);
        assert_eq!(transport.pending_writes(), 0);
        assert!(!session.is_attached());

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::DeviceAbsent));
        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Err(ChannelError::DeviceAbsent));
        assert!(matches!(session.open(), Err(ChannelError::DeviceAbsent)));
    }

    #[test]
    fn test_disconnect_wakes_blocked_reader() {
        let (transport, session, handle) = setup();
        let reader = thread::spawn(move || handle.read(4, IoMode::Blocking));

        wait_for(|| transport.pending_reads() == 1);
        session.disconnect();
        assert_eq!(reader.join().unwrap(), Err(ChannelError::DeviceAbsent));
    }

    #[test]
    fn test_interrupt_wakes_blocked_reader() {
        let (transport, _session, handle) = setup();
        let interrupter = handle.interrupter();
        let reader = thread::spawn(move || handle.read(4, IoMode::Blocking));

        wait_for(|| transport.pending_reads() == 1);
        interrupter.interrupt();
        assert_eq!(reader.join().unwrap(), Err(ChannelError::Interrupted));
        // The transfer itself is still outstanding.
        assert_eq!(transport.pending_reads(), 1);
    }

    #[test]
    fn test_interrupt_wakes_blocked_writer() {
        let (_transport, _session, handle) = setup();
        assert_eq!(handle.write(b"one", IoMode::Blocking), Ok(3));
        assert_eq!(handle.write(b"two", IoMode::Blocking), Ok(3));

        let interrupter = handle.interrupter();
        let writer = thread::spawn(move || handle.write(b"three", IoMode::Blocking));
        thread::sleep(Duration::from_millis(20));
        interrupter.interrupt();
        assert_eq!(writer.join().unwrap(), Err(ChannelError::Interrupted));
    }

    #[test]
    fn test_reset_bracket_reports_reset_once() {
        let (transport, session, handle) = setup();

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        {
            let _reset = session.begin_reset();
            assert_eq!(transport.pending_reads(), 0);
        }
        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::TransportReset));
        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
    }

    #[test]
    fn test_submission_failure_is_out_of_memory() {
        let (transport, session, handle) = setup();
        transport.reject_submissions(true);

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::OutOfMemory));
        assert!(!session.stats().read_pending);
        assert_eq!(handle.write(b"abc", IoMode::NonBlocking), Err(ChannelError::OutOfMemory));
        assert_eq!(session.stats().writes_in_flight, 0);
        assert_eq!(session.stats().free_write_slots, 2);
    }

    #[test]
    fn test_pending_transfer_keeps_session_alive() {
        let (transport, session, handle) = setup();
        let weak = Arc::downgrade(&session);

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        drop(handle);
        drop(session);
        assert!(weak.upgrade().is_some());

        assert!(transport.complete_read(b"late"));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_io_traits_use_blocking_mode() {
        use std::io::{Read, Write};

        let (transport, _session, mut handle) = setup();
        assert_eq!(Write::write(&mut handle, b"hello").unwrap(), 5);
        assert!(transport.complete_write(TransferStatus::Completed));

        let feeder = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                wait_for(|| transport.pending_reads() == 1);
                transport.complete_read(b"data")
            })
        };
        let mut buf = [0u8; 4];
        assert_eq!(Read::read(&mut handle, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"data");
        assert!(feeder.join().unwrap());
    }

    #[test]
    fn test_disconnect_releases_writer_parked_on_gate() {
        let (transport, session, handle) = setup();
        transport.ignore_cancel(true);
        assert_eq!(handle.write(b"one", IoMode::Blocking), Ok(3));
        assert_eq!(handle.write(b"two", IoMode::Blocking), Ok(3));

        let writer = thread::spawn(move || handle.write(b"three", IoMode::Blocking));
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        session.disconnect();
        assert_eq!(writer.join().unwrap(), Err(ChannelError::DeviceAbsent));
        // Both stuck writes were given up on, not completed.
        assert_eq!(transport.pending_writes(), 2);
        assert_eq!(session.stats().writes_in_flight, 0);
    }

    #[test]
    fn test_late_completion_of_abandoned_read_is_ignored() {
        let (transport, session, handle) = setup();
        transport.ignore_cancel(true);

        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        session.cancel_all();
        assert!(!session.stats().read_pending);

        // A new read is between submission and receiving its handle.
        session.state.lock().read = ReadState::Pending(None);
        assert!(transport.complete_read(b"old!"));
        {
            let st = session.state.lock();
            assert_eq!(st.read, ReadState::Pending(None));
            assert_eq!(st.filled, 0);
            assert!(st.abandoned.is_empty());
        }
        session.set_read_idle();

        transport.ignore_cancel(false);
        assert_eq!(handle.read(4, IoMode::NonBlocking), Err(ChannelError::WouldBlock));
        assert!(transport.complete_read(b"new!"));
        assert_eq!(handle.read(4, IoMode::NonBlocking), Ok(b"new!".to_vec()));
    }

    #[test]
    fn test_interrupt_survives_read_exact() {
        use std::io::Read;

        let (transport, _session, mut handle) = setup();
        let interrupter = handle.interrupter();
        let reader = thread::spawn(move || {
            let mut buf = [0u8; 4];
            handle.read_exact(&mut buf)
        });

        wait_for(|| transport.pending_reads() == 1);
        interrupter.interrupt();
        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(
            err.get_ref().and_then(|e| e.downcast_ref::<ChannelError>()),
            Some(&ChannelError::Interrupted)
        );
    }
}
