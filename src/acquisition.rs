//! Fixed-cadence frame acquisition.
//!
//! One thread per session pulls a raw frame synchronously, runs it through
//! the session's calibration engine and hands the resulting contacts to an
//! [`InputSink`].

use crate::channel::Session;
use crate::config::AcquisitionSettings;
use crate::grid::RawFrame;
use crate::sink::InputSink;
use crate::transport::TransportError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub frames: u64,
    pub skipped: u64,
    pub contacts: u64,
}

enum Tick {
    Frame(usize),
    Skipped,
    Detached,
}

/// Handle on a running acquisition thread. Dropping it stops the thread.
pub struct Acquisition {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<AcquisitionStats>>,
}

impl Acquisition {
    pub fn spawn<S: InputSink>(
        session: Arc<Session>,
        settings: AcquisitionSettings,
        sink: S,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("{}-acquire", session.name()))
            .spawn(move || run(&session, settings, sink, &thread_stop))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// True once the loop has exited on its own (device gone) or was stopped.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn stop(mut self) -> AcquisitionStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> AcquisitionStats {
        self.stop.store(true, Ordering::Release);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                log::error!("acquisition thread panicked");
                AcquisitionStats::default()
            }
            None => AcquisitionStats::default(),
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn run<S: InputSink>(
    session: &Session,
    settings: AcquisitionSettings,
    mut sink: S,
    stop: &AtomicBool,
) -> AcquisitionStats {
    let mut stats = AcquisitionStats::default();
    let mut buf = vec![0u8; session.settings().bulk_in_size];
    log::info!("{}: acquisition started", session.name());

    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();
        match tick(session, settings, &mut sink, &mut buf) {
            Tick::Frame(contacts) => {
                stats.frames += 1;
                stats.contacts += contacts as u64;
            }
            Tick::Skipped => stats.skipped += 1,
            Tick::Detached => {
                log::info!("{}: device gone, acquisition ending", session.name());
                break;
            }
        }
        if let Some(rest) = settings.poll_interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }

    log::info!(
        "{}: acquisition stopped after {} frames ({} skipped)",
        session.name(),
        stats.frames,
        stats.skipped
    );
    stats
}

fn tick<S: InputSink>(
    session: &Session,
    settings: AcquisitionSettings,
    sink: &mut S,
    buf: &mut [u8],
) -> Tick {
    let len = match session.acquire_frame(buf, settings.read_timeout) {
        Ok(len) => len,
        Err(TransportError::Disconnected) => return Tick::Detached,
        Err(TransportError::TimedOut) => {
            log::debug!("{}: no frame within {:?}", session.name(), settings.read_timeout);
            return Tick::Skipped;
        }
        Err(e) => {
            log::warn!("{}: error in bulk read: {}", session.name(), e);
            return Tick::Skipped;
        }
    };

    let Some(frame) = RawFrame::from_bytes(&buf[..len]) else {
        log::warn!("{}: short frame of {} bytes skipped", session.name(), len);
        return Tick::Skipped;
    };

    let contacts = {
        let mut engine = session.engine();
        let contacts = engine.process(&frame);
        if engine.is_calibrated() && log::log_enabled!(log::Level::Trace) {
            log::trace!("\n{}", engine.render_matrix());
        }
        contacts
    };

    for contact in &contacts {
        sink.emit_contact(contact);
    }
    sink.end_frame();
    Tick::Frame(contacts.len())
}
