//! Consumers of per-frame contact lists.

use crate::blob::Contact;
use crate::config::SensorSettings;
use crate::grid::{GRID_COLS, GRID_ROWS};
use std::sync::mpsc;

/// Receives contacts from the acquisition loop: zero or more
/// `emit_contact` calls per frame, then exactly one `end_frame`.
pub trait InputSink: Send + 'static {
    fn emit_contact(&mut self, contact: &Contact);
    fn end_frame(&mut self);
}

/// A contact scaled from cell units into the sensor's output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorContact {
    pub slot: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SensorContact {
    pub fn from_cells(contact: &Contact, sensor: SensorSettings) -> Self {
        let sx = |cells: usize| (cells as u64 * u64::from(sensor.resolution_x) / GRID_COLS as u64) as u32;
        let sy = |cells: usize| (cells as u64 * u64::from(sensor.resolution_y) / GRID_ROWS as u64) as u32;
        Self {
            slot: contact.slot,
            x: sx(contact.x),
            y: sy(contact.y),
            width: sx(contact.w),
            height: sy(contact.h),
        }
    }
}

/// All contacts seen in one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactFrame {
    pub sequence: u64,
    pub contacts: Vec<Contact>,
}

/// Logs contacts in sensor coordinates. Frames are only reported when the
/// number of contacts changes or fingers are down.
pub struct LogSink {
    sensor: SensorSettings,
    pending: Vec<Contact>,
    last_count: usize,
    frames: u64,
}

impl LogSink {
    pub fn new(sensor: SensorSettings) -> Self {
        Self {
            sensor,
            pending: Vec::new(),
            last_count: 0,
            frames: 0,
        }
    }
}

impl InputSink for LogSink {
    fn emit_contact(&mut self, contact: &Contact) {
        self.pending.push(*contact);
    }

    fn end_frame(&mut self) {
        self.frames += 1;
        if self.pending.len() != self.last_count {
            log::info!("frame {}: {} contacts", self.frames, self.pending.len());
        }
        for contact in &self.pending {
            let c = SensorContact::from_cells(contact, self.sensor);
            log::debug!(
                "  slot {} at ({}, {}) size {}x{}",
                c.slot,
                c.x,
                c.y,
                c.width,
                c.height
            );
        }
        self.last_count = self.pending.len();
        self.pending.clear();
    }
}

/// Forwards each completed frame to another thread, typically the viewer.
pub struct ChannelSink {
    tx: mpsc::Sender<ContactFrame>,
    frame: ContactFrame,
    connected: bool,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ContactFrame>) -> Self {
        Self {
            tx,
            frame: ContactFrame::default(),
            connected: true,
        }
    }
}

impl InputSink for ChannelSink {
    fn emit_contact(&mut self, contact: &Contact) {
        self.frame.contacts.push(*contact);
    }

    fn end_frame(&mut self) {
        let sequence = self.frame.sequence;
        let frame = std::mem::replace(
            &mut self.frame,
            ContactFrame {
                sequence: sequence + 1,
                contacts: Vec::new(),
            },
        );
        if self.tx.send(frame).is_err() && self.connected {
            log::debug!("contact receiver dropped, discarding frames");
            self.connected = false;
        }
    }
}
