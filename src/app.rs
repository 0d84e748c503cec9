use crate::dimensions::Dimensions;
use crate::render;
use greentouch::config::SensorSettings;
use greentouch::sink::{ContactFrame, SensorContact};
use std::collections::VecDeque;
use std::sync::mpsc;

pub const HISTORY_MAX: usize = 20;

pub struct ContactViewer {
    frame_rx: mpsc::Receiver<ContactFrame>,
    sensor: SensorSettings,
    dims: Dimensions,
    current: Vec<SensorContact>,
    history: VecDeque<Vec<SensorContact>>,
    trails: usize,
    frames_seen: u64,
    disconnected: bool,
}

impl ContactViewer {
    pub fn new(frame_rx: mpsc::Receiver<ContactFrame>, sensor: SensorSettings, trails: usize) -> Self {
        Self {
            frame_rx,
            sensor,
            dims: Dimensions::new(sensor),
            current: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_MAX),
            trails: trails.min(HISTORY_MAX),
            frames_seen: 0,
            disconnected: false,
        }
    }

    fn drain_frames(&mut self) {
        loop {
            match self.frame_rx.try_recv() {
                Ok(frame) => {
                    let contacts = frame
                        .contacts
                        .iter()
                        .map(|c| SensorContact::from_cells(c, self.sensor))
                        .collect();
                    let previous = std::mem::replace(&mut self.current, contacts);
                    if self.history.len() == HISTORY_MAX {
                        self.history.pop_back();
                    }
                    self.history.push_front(previous);
                    self.frames_seen = frame.sequence + 1;
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
    }
}

impl eframe::App for ContactViewer {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_frames();

        let screen_rect = ctx.screen_rect();
        self.dims.screen_width = screen_rect.width();
        self.dims.screen_height = screen_rect.height();

        let scale = self.dims.scale();
        let corner = self.dims.corner(scale);
        let cscale = scale.clamp(0.5, 2.0);

        egui::CentralPanel::default()
            .frame(egui::Frame::NONE.fill(egui::Color32::WHITE))
            .show(ctx, |ui| {
                let painter = ui.painter();

                render::draw_sensor_boundary(
                    painter,
                    corner,
                    self.dims.sensor_width * scale,
                    self.dims.sensor_height * scale,
                );

                for frame in self.history.iter().take(self.trails) {
                    for contact in frame {
                        render::draw_trail(painter, contact, corner, scale, cscale);
                    }
                }

                for contact in &self.current {
                    render::draw_contact(painter, contact, corner, scale, cscale);
                }

                let text = if self.disconnected {
                    "Device disconnected".to_string()
                } else if self.frames_seen == 0 {
                    "Waiting for frames".to_string()
                } else {
                    format!("frame {}  contacts {}", self.frames_seen, self.current.len())
                };
                painter.text(
                    egui::Pos2::new(self.dims.screen_width / 2.0, self.dims.margin),
                    egui::Align2::CENTER_TOP,
                    text,
                    egui::FontId::proportional(14.0),
                    egui::Color32::GRAY,
                );
            });

        ctx.request_repaint();
    }
}
