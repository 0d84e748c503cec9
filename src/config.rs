use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::grid::FRAME_LEN;

pub const CONFIG_ENV: &str = "GREENTOUCH_CONFIG";

const DEFAULT_RESOLUTION_X: u32 = 1920;
const DEFAULT_RESOLUTION_Y: u32 = 1080;
pub const DEFAULT_MAX_CONTACTS: usize = 10;
const DEFAULT_THRESHOLD: u16 = 275;
const DEFAULT_AVERAGE_FRAMES: u32 = 255;
const DEFAULT_SIGMA_FRAMES: u32 = 255;
const DEFAULT_RECALIBRATE_EVERY: u32 = 7000;
/// Largest window whose sum of 8-bit samples still fits the 32-bit accumulators.
pub const MAX_CALIBRATION_FRAMES: u32 = u32::MAX / u8::MAX as u32;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_WRITES_IN_FLIGHT: usize = 8;
// One page minus the largest high-speed bulk packet.
const DEFAULT_MAX_TRANSFER: usize = 4096 - 512;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 1000;
const DEFAULT_INTERFACE: u32 = 0;
const DEFAULT_BULK_IN_ENDPOINT: u8 = 0x81;
const DEFAULT_BULK_OUT_ENDPOINT: u8 = 0x01;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    sensor: Option<SensorConfigFile>,
    calibration: Option<CalibrationConfigFile>,
    acquisition: Option<AcquisitionConfigFile>,
    channel: Option<ChannelConfigFile>,
    usb: Option<UsbConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SensorConfigFile {
    resolution_x: Option<u32>,
    resolution_y: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CalibrationConfigFile {
    average_frames: Option<u32>,
    sigma_frames: Option<u32>,
    recalibrate_every: Option<u32>,
    threshold: Option<u16>,
    max_contacts: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AcquisitionConfigFile {
    poll_interval_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ChannelConfigFile {
    bulk_in_size: Option<usize>,
    max_transfer: Option<usize>,
    writes_in_flight: Option<usize>,
    drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct UsbConfigFile {
    interface: Option<u32>,
    bulk_in_endpoint: Option<u8>,
    bulk_out_endpoint: Option<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub sensor: SensorSettings,
    pub calibration: CalibrationSettings,
    pub acquisition: AcquisitionSettings,
    pub channel: ChannelSettings,
    pub usb: UsbSettings,
}

/// Output coordinate space contacts are mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSettings {
    pub resolution_x: u32,
    pub resolution_y: u32,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            resolution_x: DEFAULT_RESOLUTION_X,
            resolution_y: DEFAULT_RESOLUTION_Y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationSettings {
    /// Frames summed into the per-cell baseline.
    pub average_frames: u32,
    /// Frames over which the deviation proxy is accumulated.
    pub sigma_frames: u32,
    /// Frame index past which calibration restarts from scratch.
    pub recalibrate_every: u32,
    /// Smoothed score a cell must exceed to count as touched.
    pub threshold: u16,
    pub max_contacts: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            average_frames: DEFAULT_AVERAGE_FRAMES,
            sigma_frames: DEFAULT_SIGMA_FRAMES,
            recalibrate_every: DEFAULT_RECALIBRATE_EVERY,
            threshold: DEFAULT_THRESHOLD,
            max_contacts: DEFAULT_MAX_CONTACTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Size of the bulk-in buffer; one raw frame.
    pub bulk_in_size: usize,
    /// Largest payload a single write transfer carries.
    pub max_transfer: usize,
    pub writes_in_flight: usize,
    /// How long teardown waits for outstanding transfers to settle.
    pub drain_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            bulk_in_size: FRAME_LEN,
            max_transfer: DEFAULT_MAX_TRANSFER,
            writes_in_flight: DEFAULT_WRITES_IN_FLIGHT,
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSettings {
    pub interface: u32,
    pub bulk_in_endpoint: u8,
    pub bulk_out_endpoint: u8,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE,
            bulk_in_endpoint: DEFAULT_BULK_IN_ENDPOINT,
            bulk_out_endpoint: DEFAULT_BULK_OUT_ENDPOINT,
        }
    }
}

impl Config {
    /// Load from an explicit path, else from `GREENTOUCH_CONFIG`, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok();
        let path = path.or(env_path.as_deref().map(Path::new));
        let file_cfg = match path {
            Some(path) => {
                log::info!("loading config from {}", path.display());
                read_config_file(path)?
            }
            None => ConfigFile::default(),
        };
        let cfg = Self::from_file(file_cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw).context("invalid config toml")?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let defaults = Config::default();

        let sensor = file.sensor.unwrap_or_default();
        let sensor = SensorSettings {
            resolution_x: sensor.resolution_x.unwrap_or(defaults.sensor.resolution_x),
            resolution_y: sensor.resolution_y.unwrap_or(defaults.sensor.resolution_y),
        };

        let cal = file.calibration.unwrap_or_default();
        let d = defaults.calibration;
        let calibration = CalibrationSettings {
            average_frames: cal.average_frames.unwrap_or(d.average_frames),
            sigma_frames: cal.sigma_frames.unwrap_or(d.sigma_frames),
            recalibrate_every: cal.recalibrate_every.unwrap_or(d.recalibrate_every),
            threshold: cal.threshold.unwrap_or(d.threshold),
            max_contacts: cal.max_contacts.unwrap_or(d.max_contacts),
        };

        let acq = file.acquisition.unwrap_or_default();
        let acquisition = AcquisitionSettings {
            poll_interval: acq
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquisition.poll_interval),
            read_timeout: acq
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.acquisition.read_timeout),
        };

        let ch = file.channel.unwrap_or_default();
        let d = defaults.channel;
        let channel = ChannelSettings {
            bulk_in_size: ch.bulk_in_size.unwrap_or(d.bulk_in_size),
            max_transfer: ch.max_transfer.unwrap_or(d.max_transfer),
            writes_in_flight: ch.writes_in_flight.unwrap_or(d.writes_in_flight),
            drain_timeout: ch
                .drain_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(d.drain_timeout),
        };

        let usb = file.usb.unwrap_or_default();
        let d = defaults.usb;
        let usb = UsbSettings {
            interface: usb.interface.unwrap_or(d.interface),
            bulk_in_endpoint: usb.bulk_in_endpoint.unwrap_or(d.bulk_in_endpoint),
            bulk_out_endpoint: usb.bulk_out_endpoint.unwrap_or(d.bulk_out_endpoint),
        };

        Self {
            sensor,
            calibration,
            acquisition,
            channel,
            usb,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let cal = &self.calibration;
        if cal.average_frames == 0 || cal.sigma_frames == 0 {
            return Err(anyhow!(
                "calibration.average_frames and calibration.sigma_frames must be > 0"
            ));
        }
        if cal.average_frames > MAX_CALIBRATION_FRAMES || cal.sigma_frames > MAX_CALIBRATION_FRAMES {
            return Err(anyhow!(
                "calibration.average_frames and calibration.sigma_frames must be <= {}",
                MAX_CALIBRATION_FRAMES
            ));
        }
        let window = cal
            .average_frames
            .checked_add(cal.sigma_frames)
            .ok_or_else(|| anyhow!("calibration window overflows"))?;
        if cal.recalibrate_every <= window || cal.recalibrate_every == u32::MAX {
            return Err(anyhow!(
                "calibration.recalibrate_every ({}) must exceed the calibration window ({}) and be below {}",
                cal.recalibrate_every,
                window,
                u32::MAX
            ));
        }
        if cal.max_contacts == 0 {
            return Err(anyhow!("calibration.max_contacts must be > 0"));
        }
        if self.channel.bulk_in_size < FRAME_LEN {
            return Err(anyhow!(
                "channel.bulk_in_size must hold one frame ({} bytes)",
                FRAME_LEN
            ));
        }
        if self.channel.max_transfer == 0 || self.channel.writes_in_flight == 0 {
            return Err(anyhow!(
                "channel.max_transfer and channel.writes_in_flight must be > 0"
            ));
        }
        if self.sensor.resolution_x == 0 || self.sensor.resolution_y == 0 {
            return Err(anyhow!("sensor resolution must be non-zero"));
        }
        if self.usb.bulk_in_endpoint & 0x80 == 0 {
            return Err(anyhow!(
                "usb.bulk_in_endpoint 0x{:02X} is not an IN endpoint",
                self.usb.bulk_in_endpoint
            ));
        }
        if self.usb.bulk_out_endpoint & 0x80 != 0 {
            return Err(anyhow!(
                "usb.bulk_out_endpoint 0x{:02X} is not an OUT endpoint",
                self.usb.bulk_out_endpoint
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.sensor.resolution_x, 1920);
        assert_eq!(cfg.sensor.resolution_y, 1080);
        assert_eq!(cfg.calibration.max_contacts, 10);
        assert_eq!(cfg.calibration.threshold, 275);
        assert_eq!(cfg.calibration.average_frames, 255);
        assert_eq!(cfg.calibration.sigma_frames, 255);
        assert_eq!(cfg.calibration.recalibrate_every, 7000);
        assert_eq!(cfg.acquisition.poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.channel.writes_in_flight, 8);
        assert_eq!(cfg.channel.max_transfer, 3584);
        assert_eq!(cfg.channel.bulk_in_size, 4160);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let cfg = Config::from_toml(
            r#"
            [calibration]
            threshold = 300
            max_contacts = 5

            [acquisition]
            poll_interval_ms = 20

            [usb]
            bulk_in_endpoint = 0x82
            "#,
        )
        .unwrap();

        assert_eq!(cfg.calibration.threshold, 300);
        assert_eq!(cfg.calibration.max_contacts, 5);
        assert_eq!(cfg.calibration.average_frames, 255);
        assert_eq!(cfg.acquisition.poll_interval, Duration::from_millis(20));
        assert_eq!(cfg.acquisition.read_timeout, Duration::from_millis(1000));
        assert_eq!(cfg.usb.bulk_in_endpoint, 0x82);
        assert_eq!(cfg.usb.bulk_out_endpoint, 0x01);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::from_toml("[calibration]\nthreshhold = 3\n").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::from_toml("[calibration]\naverage_frames = 0\n").is_err());
        assert!(Config::from_toml("[calibration]\nrecalibrate_every = 100\n").is_err());
        assert!(Config::from_toml(
            "[calibration]\naverage_frames = 4000000000\nsigma_frames = 4000000000\n"
        )
        .is_err());
        assert!(Config::from_toml("[calibration]\naverage_frames = 16843010\n").is_err());
        assert!(Config::from_toml("[calibration]\nrecalibrate_every = 4294967295\n").is_err());
        assert!(Config::from_toml("[channel]\nbulk_in_size = 64\n").is_err());
        assert!(Config::from_toml("[channel]\nwrites_in_flight = 0\n").is_err());
        assert!(Config::from_toml("[usb]\nbulk_in_endpoint = 1\n").is_err());
        assert!(Config::from_toml("[usb]\nbulk_out_endpoint = 0x81\n").is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greentouch.toml");
        std::fs::write(&path, "[sensor]\nresolution_x = 3840\n").unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.sensor.resolution_x, 3840);
        assert_eq!(cfg.sensor.resolution_y, 1080);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
