mod app;
mod dimensions;
mod render;

use anyhow::{anyhow, Context, Result};
use app::ContactViewer;
use clap::Parser;
use greentouch::acquisition::Acquisition;
use greentouch::calibration::Engine;
use greentouch::channel::{IoMode, Session};
use greentouch::config::{Config, CONFIG_ENV};
use greentouch::sink::{ChannelSink, LogSink};
use greentouch::transport::replay::ReplayTransport;
use greentouch::transport::Transport;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "greentouch", about = "GreenTouch touch-foil driver")]
struct Cli {
    /// usbfs device node, e.g. /dev/bus/usb/001/004
    #[arg(required_unless_present = "replay", conflicts_with = "replay")]
    device: Option<PathBuf>,

    /// Replay a raw frame capture instead of opening a device
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Draw contacts in a window
    #[arg(long)]
    view: bool,

    /// Number of trail frames to show (max 20)
    #[arg(short, long, default_value_t = 10)]
    trails: usize,

    /// Copy the raw byte stream into FILE instead of tracking contacts
    #[arg(long, value_name = "FILE", conflicts_with = "view")]
    capture: Option<PathBuf>,

    /// Bytes to copy in capture mode
    #[arg(long, default_value_t = 416_000)]
    capture_bytes: u64,

    /// Write the contents of FILE to the device before starting
    #[arg(long, value_name = "FILE")]
    send: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    let transport = open_transport(&cli, &config)?;
    let session = Session::attach(
        "greentouch0",
        transport,
        config.channel,
        Engine::new(config.calibration),
    );

    if let Some(path) = &cli.send {
        send_file(&session, path)?;
    }

    let result = if let Some(path) = &cli.capture {
        capture(&session, path, cli.capture_bytes)
    } else if cli.view {
        run_viewer(&session, &config, cli.trails)
    } else {
        run_headless(&session, &config)
    };

    session.disconnect();
    result
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn open_transport(cli: &Cli, config: &Config) -> Result<Arc<dyn Transport>> {
    if let Some(path) = &cli.replay {
        let replay = ReplayTransport::open(path, config.acquisition.poll_interval)
            .with_context(|| format!("failed to load capture {}", path.display()))?;
        log::info!("replaying {}", path.display());
        return Ok(Arc::new(replay));
    }
    let device = cli
        .device
        .as_deref()
        .ok_or_else(|| anyhow!("no device node given"))?;
    open_usbfs(device, config)
}

#[cfg(target_os = "linux")]
fn open_usbfs(path: &Path, config: &Config) -> Result<Arc<dyn Transport>> {
    let transport = greentouch::transport::usbfs::UsbfsTransport::open(path, config.usb)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(transport))
}

#[cfg(not(target_os = "linux"))]
fn open_usbfs(path: &Path, _config: &Config) -> Result<Arc<dyn Transport>> {
    Err(anyhow!(
        "cannot open {}: usbfs devices are only supported on Linux, use --replay",
        path.display()
    ))
}

fn send_file(session: &Arc<Session>, path: &Path) -> Result<()> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let handle = session.open()?;

    let mut offset = 0;
    while offset < data.len() {
        let n = handle.write(&data[offset..], IoMode::Blocking)?;
        if n == 0 {
            return Err(anyhow!("device has no bulk-out endpoint"));
        }
        offset += n;
    }
    handle.flush()?;
    log::info!("sent {} bytes from {}", data.len(), path.display());
    Ok(())
}

fn capture(session: &Arc<Session>, path: &Path, limit: u64) -> Result<()> {
    let mut out =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let handle = session.open()?;
    let chunk = session.settings().bulk_in_size as u64;

    let mut written = 0u64;
    while written < limit {
        let want = (limit - written).min(chunk) as usize;
        let bytes = handle.read(want, IoMode::Blocking)?;
        if bytes.is_empty() {
            break;
        }
        out.write_all(&bytes)?;
        written += bytes.len() as u64;
    }
    out.flush()?;
    log::info!("captured {} bytes to {}", written, path.display());
    Ok(())
}

fn run_headless(session: &Arc<Session>, config: &Config) -> Result<()> {
    let acquisition = Acquisition::spawn(
        Arc::clone(session),
        config.acquisition,
        LogSink::new(config.sensor),
    )?;
    while !acquisition.is_finished() {
        thread::sleep(Duration::from_millis(200));
    }
    let stats = acquisition.stop();
    log::info!(
        "{} frames, {} skipped, {} contacts",
        stats.frames,
        stats.skipped,
        stats.contacts
    );
    Ok(())
}

fn run_viewer(session: &Arc<Session>, config: &Config, trails: usize) -> Result<()> {
    let (frame_tx, frame_rx) = mpsc::channel();
    let acquisition = Acquisition::spawn(
        Arc::clone(session),
        config.acquisition,
        ChannelSink::new(frame_tx),
    )?;

    let sensor = config.sensor;
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([672.0, 432.0])
            .with_min_inner_size([320.0, 240.0])
            .with_title("GreenTouch - Contact Viewer"),
        ..Default::default()
    };

    eframe::run_native(
        "GreenTouch",
        options,
        Box::new(move |_cc| Ok(Box::new(ContactViewer::new(frame_rx, sensor, trails)))),
    )
    .map_err(|e| anyhow!("viewer failed: {}", e))?;

    acquisition.stop();
    Ok(())
}
