//! Per-cell baseline calibration and score normalisation.
//!
//! The engine walks through four phases keyed on the frame index: sum the
//! raw samples, divide into a baseline, sum absolute deviations from that
//! baseline, divide into a per-cell spread. After that every frame is turned
//! into deviation scores, spatially summed, temporally smoothed and handed to
//! the blob extractor. Calibration restarts from scratch periodically.

use crate::blob::{extract_contacts, Contact};
use crate::config::CalibrationSettings;
use crate::grid::{Cell, CellGrid, GRID_COLS, GRID_ROWS, RawFrame};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalibrationState {
    pub frame_index: u32,
    pub average_ready: bool,
    pub variance_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Averaging,
    AverageFinalize,
    Deviation,
    DeviationFinalize,
    Steady,
}

pub struct Engine {
    settings: CalibrationSettings,
    state: CalibrationState,
    /// Sample sum during averaging, baseline afterwards.
    average: CellGrid<u32>,
    /// Deviation sum while accumulating, spread (>= 1) afterwards.
    sigma: CellGrid<u32>,
    score: CellGrid<u16>,
    adjacent: CellGrid<u16>,
    previous: CellGrid<u16>,
}

impl Engine {
    pub fn new(settings: CalibrationSettings) -> Self {
        Self {
            settings,
            state: CalibrationState::default(),
            average: CellGrid::new(),
            sigma: CellGrid::filled(1),
            score: CellGrid::new(),
            adjacent: CellGrid::new(),
            previous: CellGrid::new(),
        }
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.average_ready && self.state.variance_ready
    }

    pub fn average(&self, cell: Cell) -> u32 {
        self.average[cell]
    }

    pub fn sigma(&self, cell: Cell) -> u32 {
        self.sigma[cell]
    }

    /// Temporally smoothed adjacency scores from the last steady-state frame.
    pub fn smoothed(&self) -> &CellGrid<u16> {
        &self.previous
    }

    fn phase(&self) -> Phase {
        let f = self.state.frame_index;
        let n_avg = self.settings.average_frames;
        let n_sigma = self.settings.sigma_frames;
        if !self.state.average_ready {
            if f < n_avg {
                Phase::Averaging
            } else {
                Phase::AverageFinalize
            }
        } else if !self.state.variance_ready {
            if f < n_avg + n_sigma {
                Phase::Deviation
            } else {
                Phase::DeviationFinalize
            }
        } else {
            Phase::Steady
        }
    }

    /// Feed one frame. Returns the contacts found, which is always empty
    /// until calibration has completed.
    pub fn process(&mut self, frame: &RawFrame) -> Vec<Contact> {
        let contacts = match self.phase() {
            Phase::Averaging => {
                self.accumulate_average(frame);
                Vec::new()
            }
            Phase::AverageFinalize => {
                self.finalize_average();
                Vec::new()
            }
            Phase::Deviation => {
                self.accumulate_deviation(frame);
                Vec::new()
            }
            Phase::DeviationFinalize => {
                self.finalize_deviation();
                Vec::new()
            }
            Phase::Steady => self.score_frame(frame),
        };

        self.state.frame_index += 1;
        if self.state.frame_index > self.settings.recalibrate_every {
            self.restart();
        }
        contacts
    }

    fn accumulate_average(&mut self, frame: &RawFrame) {
        let first = self.state.frame_index == 0;
        for cell in Cell::all() {
            let sample = u32::from(frame.sample(cell));
            if first {
                self.average[cell] = sample;
            } else {
                self.average[cell] += sample;
            }
        }
    }

    fn finalize_average(&mut self) {
        let n = self.settings.average_frames;
        for cell in Cell::all() {
            self.average[cell] = narrow(self.average[cell] / n);
        }
        self.sigma.fill(0);
        self.state.average_ready = true;
        log::info!("average computed over {} frames", n);
    }

    fn accumulate_deviation(&mut self, frame: &RawFrame) {
        for cell in Cell::all() {
            self.sigma[cell] += u32::from(frame.sample(cell)).abs_diff(self.average[cell]);
        }
    }

    fn finalize_deviation(&mut self) {
        let n = self.settings.sigma_frames;
        for cell in Cell::all() {
            self.sigma[cell] = narrow(self.sigma[cell] / n).max(1);
        }
        self.state.variance_ready = true;
        log::info!("sigma computed over {} frames", n);
    }

    fn score_frame(&mut self, frame: &RawFrame) -> Vec<Contact> {
        for cell in Cell::all() {
            let deviation = u32::from(frame.sample(cell)).abs_diff(self.average[cell]);
            self.score[cell] = narrow(deviation / self.sigma[cell]) as u16;
        }

        for cell in Cell::all() {
            let summed = self.window_sum(cell);
            let smoothed = (summed + u32::from(self.previous[cell])) / 2;
            self.adjacent[cell] = narrow(smoothed) as u16;
        }
        self.previous.copy_from(&self.adjacent);

        let contacts = extract_contacts(
            &self.adjacent,
            self.settings.threshold,
            self.settings.max_contacts,
        );
        if !contacts.is_empty() {
            log::debug!("frame {}: {} contacts", self.state.frame_index, contacts.len());
        }
        contacts
    }

    /// Sum of scores in the 3x3 window around `cell`. Row 0 and column 0
    /// never contribute.
    fn window_sum(&self, cell: Cell) -> u32 {
        let mut sum = 0u32;
        for d_row in -1..=1 {
            for d_col in -1..=1 {
                if let Some(n) = cell.offset(d_row, d_col) {
                    if n.row > 0 && n.col > 0 {
                        sum += u32::from(self.score[n]);
                    }
                }
            }
        }
        sum
    }

    fn restart(&mut self) {
        self.state = CalibrationState::default();
        self.previous.fill(0);
        log::info!("calibration relaunched");
    }

    /// Text dump of the smoothed score matrix, two characters per cell:
    /// blank at or under the threshold, `XX` above 999, else score / 10.
    pub fn render_matrix(&self) -> String {
        let mut out = String::with_capacity((GRID_COLS * 2 + 3) * (GRID_ROWS + 1));
        out.push_str(&"#".repeat(GRID_COLS));
        out.push('\n');
        for row in 0..GRID_ROWS {
            let _ = write!(out, "{:2}", row);
            for col in 0..GRID_COLS {
                let score = self.previous[Cell::new(row, col)];
                if score <= self.settings.threshold {
                    out.push_str("  ");
                } else if score / 10 > 99 {
                    out.push_str("XX");
                } else {
                    let _ = write!(out, "{:02}", score / 10);
                }
            }
            out.push('\n');
        }
        out
    }
}

fn narrow(value: u32) -> u32 {
    value.min(u32::from(u16::MAX))
}
