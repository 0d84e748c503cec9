//! Bulk transfers through a Linux usbfs device node (`/dev/bus/usb/BBB/DDD`).
//!
//! Endpoint addresses and the interface number come from configuration;
//! this adapter does not walk descriptors.

use super::worker::{JobOutcome, TransferTable};
use super::{
    CompletionFn, Endpoints, TransferHandle, TransferStatus, Transport, TransportError,
};
use crate::config::UsbSettings;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// usbfs ioctl numbers from the Linux _IOC macro, type 'U' = 0x55:
//   USBDEVFS_BULK             = _IOWR('U', 2, struct usbdevfs_bulktransfer)
//   USBDEVFS_CLAIMINTERFACE   = _IOR('U', 15, unsigned int)
//   USBDEVFS_RELEASEINTERFACE = _IOR('U', 16, unsigned int)

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> libc::c_ulong {
    ((dir << 30) | (size << 16) | (ty << 8) | nr) as libc::c_ulong
}

#[repr(C)]
struct BulkTransfer {
    ep: libc::c_uint,
    len: libc::c_uint,
    timeout: libc::c_uint,
    data: *mut libc::c_void,
}

const USBDEVFS_BULK: libc::c_ulong = ioc(
    IOC_WRITE | IOC_READ,
    b'U' as u32,
    2,
    std::mem::size_of::<BulkTransfer>() as u32,
);
const USBDEVFS_CLAIMINTERFACE: libc::c_ulong = ioc(
    IOC_READ,
    b'U' as u32,
    15,
    std::mem::size_of::<libc::c_uint>() as u32,
);
const USBDEVFS_RELEASEINTERFACE: libc::c_ulong = ioc(
    IOC_READ,
    b'U' as u32,
    16,
    std::mem::size_of::<libc::c_uint>() as u32,
);

/// Async reads are issued in slices this long so cancellation is noticed.
const READ_SLICE_MS: u32 = 100;
const WRITE_TIMEOUT_MS: u32 = 1000;

pub struct UsbfsTransport {
    fd: Arc<OwnedFd>,
    settings: UsbSettings,
    table: Arc<TransferTable>,
}

impl UsbfsTransport {
    pub fn open(path: &Path, settings: UsbSettings) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = OwnedFd::from(file);

        let interface: libc::c_uint = settings.interface;
        let ret = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                USBDEVFS_CLAIMINTERFACE,
                &interface as *const libc::c_uint,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        log::info!(
            "usbfs: claimed interface {} on {} (in 0x{:02X}, out 0x{:02X})",
            settings.interface,
            path.display(),
            settings.bulk_in_endpoint,
            settings.bulk_out_endpoint
        );

        Ok(Self {
            fd: Arc::new(fd),
            settings,
            table: TransferTable::new("usbfs"),
        })
    }
}

fn bulk(fd: RawFd, endpoint: u8, buf: &mut [u8], timeout_ms: u32) -> io::Result<usize> {
    let mut xfer = BulkTransfer {
        ep: endpoint as libc::c_uint,
        len: buf.len() as libc::c_uint,
        timeout: timeout_ms,
        data: buf.as_mut_ptr() as *mut libc::c_void,
    };
    let ret = unsafe { libc::ioctl(fd, USBDEVFS_BULK, &mut xfer as *mut BulkTransfer) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn status_for(err: &io::Error) -> TransferStatus {
    match err.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ECONNRESET) => TransferStatus::Cancelled,
        Some(libc::ESHUTDOWN) | Some(libc::ENODEV) => TransferStatus::Shutdown,
        Some(libc::EPIPE) => TransferStatus::Stalled,
        Some(code) => TransferStatus::Fault(code),
        None => TransferStatus::Fault(libc::EIO),
    }
}

fn read_job(
    fd: Arc<OwnedFd>,
    endpoint: u8,
    mut buffer: Vec<u8>,
    len: usize,
    cancelled: &AtomicBool,
) -> JobOutcome {
    loop {
        if cancelled.load(Ordering::Acquire) {
            return (TransferStatus::Cancelled, buffer, 0);
        }
        match bulk(fd.as_raw_fd(), endpoint, &mut buffer[..len], READ_SLICE_MS) {
            Ok(n) => return (TransferStatus::Completed, buffer, n),
            Err(e) if e.raw_os_error() == Some(libc::ETIMEDOUT) => continue,
            Err(e) => return (status_for(&e), buffer, 0),
        }
    }
}

impl Transport for UsbfsTransport {
    fn endpoints(&self) -> Endpoints {
        Endpoints {
            bulk_in: Some(self.settings.bulk_in_endpoint),
            bulk_out: Some(self.settings.bulk_out_endpoint),
        }
    }

    fn submit_read(
        &self,
        buffer: Vec<u8>,
        max_len: usize,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError> {
        let fd = Arc::clone(&self.fd);
        let endpoint = self.settings.bulk_in_endpoint;
        let len = max_len.min(buffer.len());
        self.table.spawn(
            move |cancelled| read_job(fd, endpoint, buffer, len, cancelled),
            on_complete,
        )
    }

    fn submit_write(
        &self,
        mut buffer: Vec<u8>,
        on_complete: CompletionFn,
    ) -> Result<TransferHandle, TransportError> {
        let fd = Arc::clone(&self.fd);
        let endpoint = self.settings.bulk_out_endpoint;
        self.table.spawn(
            move |cancelled| {
                if cancelled.load(Ordering::Acquire) {
                    return (TransferStatus::Cancelled, buffer, 0);
                }
                match bulk(fd.as_raw_fd(), endpoint, &mut buffer, WRITE_TIMEOUT_MS) {
                    Ok(n) => (TransferStatus::Completed, buffer, n),
                    Err(e) => (status_for(&e), buffer, 0),
                }
            },
            on_complete,
        )
    }

    fn cancel(&self, handle: TransferHandle) {
        self.table.cancel(handle);
    }

    fn bulk_read(&self, buffer: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        bulk(
            self.fd.as_raw_fd(),
            self.settings.bulk_in_endpoint,
            buffer,
            timeout_ms,
        )
        .map_err(|e| match e.raw_os_error() {
            Some(libc::ETIMEDOUT) => TransportError::TimedOut,
            Some(libc::ENODEV) | Some(libc::ESHUTDOWN) => TransportError::Disconnected,
            Some(libc::ENOMEM) => TransportError::NoMemory,
            _ => TransportError::Io(e),
        })
    }
}

impl Drop for UsbfsTransport {
    fn drop(&mut self) {
        self.table.cancel_all();
        let interface: libc::c_uint = self.settings.interface;
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                USBDEVFS_RELEASEINTERFACE,
                &interface as *const libc::c_uint,
            )
        };
        if ret < 0 {
            log::debug!(
                "usbfs: releasing interface {} failed: {}",
                self.settings.interface,
                io::Error::last_os_error()
            );
        }
    }
}
