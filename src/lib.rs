//! Driver core for the GreenTouch touch foil: a buffered transfer channel
//! over a bulk transport, per-cell calibration, blob extraction into finger
//! contacts, and the acquisition loop that ties them together.

pub mod acquisition;
pub mod blob;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod error;
pub mod grid;
pub mod sink;
pub mod transport;
