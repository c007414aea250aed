// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! Delay-line calibration
//!
//! The search runs in two phases over the tap space:
//!
//! 1. **Saturation**: starting at `idc = 0` with `idf = 0`, capture up to
//!    `repeats` traces per coarse step. The phase ends at the first `idc` where
//!    any capture shows a minimum weight below the sensor width. Walking past
//!    the coarse field fails with [`Error::CoarseSearchExhausted`].
//! 2. **Validity**: from that `idc` upward, look for a tap whose `repeats`
//!    captures all stay off the floor and away from saturation. The coarse
//!    variant only moves `idc`; the coarse+fine variant sweeps `idf` over
//!    `0..idf_bits` for each `idc` and uses a wider margin below saturation.
//!    If nothing qualifies the last tap tried stays in place: `(idc_bits, 0)`
//!    for the coarse variant, `(idc_bits, idf_bits - 1)` for coarse+fine.
//!
//! All progress lives in a [`SearchCursor`], so a search interrupted by a link
//! failure resumes exactly where it stopped once the board is reconnected.
//! A stop flag is checked between steps; a set flag ends the search with
//! [`Error::Interrupted`].

use crate::board::{Board, Stimulus};
use crate::decoder::{weight_extrema, SampleStride};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::sinks;
use crate::thermometer::{pack_calibration_word, CalibrationLayout, CalibrationWord, DelayTap};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How the sensor tap is chosen before acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationMode {
    /// Leave the sensor as the board configured it
    Skip,
    /// Write a fixed tap to every sensor
    Manual(DelayTap),
    /// Replay words from a calibration file, one per sensor
    FromFile(PathBuf),
    /// Two-phase search moving the coarse tap only
    Coarse,
    /// Two-phase search sweeping the fine tap for each coarse step
    CoarseFine,
}

/// Search thresholds and capture parameters
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub layout: CalibrationLayout,
    /// Bits per sample, i.e. the weight of a saturated sample
    pub sensor_width: u32,
    /// Captures per tap
    pub repeats: u32,
    /// Minimum weight every capture must reach in the validity phase
    pub weight_floor: u32,
    /// Distance kept below saturation by the coarse+fine variant
    pub fine_margin: u32,
    pub stride: SampleStride,
    pub stimulus: Stimulus,
    /// Link failures tolerated before the search gives up
    pub max_failures: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            layout: CalibrationLayout::default(),
            sensor_width: 128,
            repeats: 10,
            weight_floor: 32,
            fine_margin: 20,
            stride: SampleStride::Exact,
            stimulus: Stimulus {
                key: [0u8; 16],
                plaintext: [0u8; 16],
            },
            max_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Saturation,
    Validity,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Coarse,
    CoarseFine,
}

/// Restartable search position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCursor {
    pub phase: Phase,
    pub idc: u32,
    pub idf: u32,
    /// Captures at the current tap that already counted toward the phase test
    pub repeat: u32,
    /// Whether the current tap has been written to the device
    pub pushed: bool,
    /// Tap accepted as the result, set once `phase` is `Done`
    pub accepted: Option<DelayTap>,
}

impl Default for SearchCursor {
    fn default() -> Self {
        Self {
            phase: Phase::Saturation,
            idc: 0,
            idf: 0,
            repeat: 0,
            pushed: false,
            accepted: None,
        }
    }
}

impl SearchCursor {
    pub fn tap(&self) -> DelayTap {
        DelayTap::new(self.idc, self.idf)
    }

    fn step(&mut self, idc: u32, idf: u32) {
        self.idc = idc;
        self.idf = idf;
        self.repeat = 0;
        self.pushed = false;
    }

    fn accept(&mut self, tap: DelayTap) {
        self.phase = Phase::Done;
        self.accepted = Some(tap);
    }
}

/// Two-phase tap search
pub struct Search {
    variant: Variant,
    params: SearchParams,
    cursor: SearchCursor,
    metrics: Option<Metrics>,
    stop: Option<Arc<AtomicBool>>,
}

impl Search {
    pub fn new(variant: Variant, params: SearchParams) -> Self {
        Self {
            variant,
            params,
            cursor: SearchCursor::default(),
            metrics: None,
            stop: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Continue from a saved position
    pub fn with_cursor(mut self, cursor: SearchCursor) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> &SearchCursor {
        &self.cursor
    }

    /// Forget whether the current tap reached the device, e.g. after a reconnect
    pub fn invalidate(&mut self) {
        self.cursor.pushed = false;
    }

    /// Drive the search to an accepted tap
    ///
    /// On error the cursor keeps the position of the failed capture; calling
    /// `run` again repeats that capture.
    pub fn run<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<DelayTap> {
        loop {
            match self.cursor.phase {
                Phase::Done => {
                    return Ok(self.cursor.accepted.unwrap_or_else(|| self.cursor.tap()));
                }
                _ if self.stop.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed)) => {
                    warn!("Stop requested, search halted at {:?}", self.cursor);
                    return Err(Error::Interrupted);
                }
                Phase::Saturation => self.saturation_step(board)?,
                Phase::Validity => match self.variant {
                    Variant::Coarse => self.coarse_step(board)?,
                    Variant::CoarseFine => self.fine_step(board)?,
                },
            }
        }
    }

    fn push<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<()> {
        if self.cursor.pushed {
            return Ok(());
        }
        let word = pack_calibration_word(self.cursor.tap(), self.params.layout)?;
        for sensor in 0..board.sensor_count() {
            board.write_calibration(sensor, &word)?;
        }
        self.cursor.pushed = true;
        Ok(())
    }

    fn capture<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<(u32, u32)> {
        let trace = board.capture_calibration_trace(&self.params.stimulus)?;
        let (min, max) = weight_extrema(&trace, self.params.stride)?;
        if let Some(metrics) = &self.metrics {
            metrics.record_calibration_capture();
        }
        debug!(
            "Capture {} at {}: min={} max={}",
            self.cursor.repeat + 1,
            self.cursor.tap(),
            min,
            max
        );
        Ok((min, max))
    }

    fn saturation_step<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<()> {
        let width = self.params.sensor_width;
        if self.cursor.idc > self.params.layout.idc_bits {
            return Err(Error::CoarseSearchExhausted {
                coarse_width: self.params.layout.idc_bits,
            });
        }

        let idc = self.cursor.idc;
        if self.cursor.idf != 0 {
            self.cursor.step(idc, 0);
        }
        self.push(board)?;

        while self.cursor.repeat < self.params.repeats {
            let (min, _) = self.capture(board)?;
            self.cursor.repeat += 1;
            if min != width {
                info!("Sensor leaves saturation at idc={}", idc);
                self.cursor.phase = Phase::Validity;
                self.cursor.repeat = 0;
                return Ok(());
            }
        }

        self.cursor.step(idc + 1, 0);
        Ok(())
    }

    fn coarse_step<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<()> {
        let limit = self.params.layout.idc_bits;
        if self.cursor.idc > limit {
            let tap = DelayTap::new(limit, 0);
            warn!("No coarse tap satisfied the validity test, keeping last tried {}", tap);
            self.cursor.accept(tap);
            return Ok(());
        }

        self.push(board)?;
        let (floor, width) = (self.params.weight_floor, self.params.sensor_width);
        while self.cursor.repeat < self.params.repeats {
            let (min, max) = self.capture(board)?;
            if min < floor || max == width {
                let idc = self.cursor.idc;
                self.cursor.step(idc + 1, 0);
                return Ok(());
            }
            self.cursor.repeat += 1;
        }

        let tap = self.cursor.tap();
        info!("Accepted {}", tap);
        self.cursor.accept(tap);
        Ok(())
    }

    fn fine_step<B: Board + ?Sized>(&mut self, board: &mut B) -> Result<()> {
        let layout = self.params.layout;
        if self.cursor.idc > layout.idc_bits {
            let tap = DelayTap::new(layout.idc_bits, layout.idf_bits.saturating_sub(1));
            warn!("No coarse/fine tap satisfied the validity test, keeping last tried {}", tap);
            self.cursor.accept(tap);
            return Ok(());
        }
        if self.cursor.idf >= layout.idf_bits {
            let idc = self.cursor.idc;
            self.cursor.step(idc + 1, 0);
            return Ok(());
        }

        self.push(board)?;
        let floor = self.params.weight_floor;
        let ceiling = self.params.sensor_width.saturating_sub(self.params.fine_margin);
        while self.cursor.repeat < self.params.repeats {
            let (min, max) = self.capture(board)?;
            if min < floor || max >= ceiling {
                let (idc, idf) = (self.cursor.idc, self.cursor.idf);
                self.cursor.step(idc, idf + 1);
                return Ok(());
            }
            self.cursor.repeat += 1;
        }

        let tap = self.cursor.tap();
        info!("Accepted {}", tap);
        self.cursor.accept(tap);
        Ok(())
    }
}

/// Result of a calibration run
#[derive(Debug, Clone, Default)]
pub struct CalibrationReport {
    /// Word written to each sensor, empty when calibration was skipped
    pub words: Vec<CalibrationWord>,
    /// Tap found by a search, if one ran
    pub tap: Option<DelayTap>,
    /// Link failures recovered along the way
    pub failures: u32,
}

/// Runs a calibration mode against a board, reconnecting on link failures
pub struct Calibrator<'a, B: Board + ?Sized> {
    board: &'a mut B,
    params: SearchParams,
    policy: RetryPolicy,
    metrics: Option<Metrics>,
    stop: Option<Arc<AtomicBool>>,
    failures: u32,
}

impl<'a, B: Board + ?Sized> Calibrator<'a, B> {
    pub fn new(board: &'a mut B, params: SearchParams, policy: RetryPolicy) -> Self {
        Self {
            board,
            params,
            policy,
            metrics: None,
            stop: None,
            failures: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Abandon a running search once `flag` is set
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    /// Run `mode`; search results are also written to `persist` when given
    pub fn run(mut self, mode: &CalibrationMode, persist: Option<&Path>) -> Result<CalibrationReport> {
        let sensors = self.board.sensor_count();
        let (words, tap) = match mode {
            CalibrationMode::Skip => {
                info!("Calibration skipped");
                return Ok(CalibrationReport::default());
            }
            CalibrationMode::Manual(tap) => {
                info!("Using manual calibration {}", tap);
                let word = pack_calibration_word(*tap, self.params.layout)?;
                (vec![word; sensors], None)
            }
            CalibrationMode::FromFile(path) => {
                let stored = sinks::read_calibration_file(path, self.params.layout)?;
                info!("Loaded {} calibration word(s) from {}", stored.len(), path.display());
                (Self::spread(stored, sensors)?, None)
            }
            CalibrationMode::Coarse => {
                let tap = self.search(Variant::Coarse)?;
                (vec![pack_calibration_word(tap, self.params.layout)?; sensors], Some(tap))
            }
            CalibrationMode::CoarseFine => {
                let tap = self.search(Variant::CoarseFine)?;
                (vec![pack_calibration_word(tap, self.params.layout)?; sensors], Some(tap))
            }
        };

        for (sensor, word) in words.iter().enumerate() {
            self.recovering(|board| board.write_calibration(sensor, word))?;
            info!("Sensor {} calibrated with {} ({})", sensor, word.tap(), word);
        }

        if let (Some(path), Some(_)) = (persist, tap) {
            sinks::write_calibration_file(path, &words)?;
            debug!("Calibration persisted to {}", path.display());
        }

        Ok(CalibrationReport {
            words,
            tap,
            failures: self.failures,
        })
    }

    fn spread(stored: Vec<CalibrationWord>, sensors: usize) -> Result<Vec<CalibrationWord>> {
        match stored.len() {
            n if n >= sensors => Ok(stored.into_iter().take(sensors).collect()),
            1 => Ok(vec![stored[0].clone(); sensors]),
            n => Err(Error::Config(format!(
                "calibration file holds {} word(s) for {} sensor(s)",
                n, sensors
            ))),
        }
    }

    fn search(&mut self, variant: Variant) -> Result<DelayTap> {
        let mut search = Search::new(variant, self.params.clone());
        if let Some(metrics) = &self.metrics {
            search = search.with_metrics(metrics.clone());
        }
        if let Some(flag) = &self.stop {
            search = search.with_stop_flag(Arc::clone(flag));
        }
        info!("Starting {:?} calibration search", variant);

        loop {
            match search.run(&mut *self.board) {
                Ok(tap) => return Ok(tap),
                Err(e) if e.is_retryable() => {
                    self.recover(e)?;
                    search.invalidate();
                    debug!("Resuming search at {:?}", search.cursor());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn recovering<T>(&mut self, mut op: impl FnMut(&mut B) -> Result<T>) -> Result<T> {
        loop {
            match op(&mut *self.board) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => self.recover(e)?,
                Err(e) => return Err(e),
            }
        }
    }

    fn recover(&mut self, err: Error) -> Result<()> {
        self.failures += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_failure();
        }
        if self.failures > self.params.max_failures {
            return Err(err);
        }
        warn!("Calibration interrupted ({}), reconnecting", err);
        let board = &mut *self.board;
        self.policy.execute(|| board.reconnect())?;
        if let Some(metrics) = &self.metrics {
            metrics.record_reconnect();
        }
        Ok(())
    }
}
