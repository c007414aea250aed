//! Calibration against a register-mapped board with several sensors

use rds_core::board::{Board, MappedBoard, MappedBoardConfig};
use rds_core::calibration::{CalibrationMode, Calibrator, SearchParams};
use rds_core::error::{LinkError, Step};
use rds_core::link::{Link, LinkResult};
use rds_core::registers::RegisterMap;
use rds_core::retry::RetryPolicy;
use rds_core::thermometer::{CalibrationLayout, CalibrationWord, DelayTap};
use rds_core::Error;
use std::collections::HashMap;

const SENSORS: usize = 3;
const SAMPLES: usize = 4;

type Model = Box<dyn Fn(DelayTap) -> (u32, u32)>;

/// Acquisition kernel behind a register interface
///
/// Latches the staged calibration registers on a commit, answers a
/// calibration trigger with one busy status read followed by idle, and fills
/// the DMA rows from the tap committed to sensor 0.
struct Kernel {
    regs: RegisterMap,
    model: Model,
    staged: HashMap<u32, u32>,
    committed: Vec<Option<DelayTap>>,
    busy_reads: u32,
    stall_on_trigger: Option<usize>,
    stalled: bool,
    stall_always: bool,

    commits: Vec<(usize, DelayTap)>,
    triggers: usize,
    reopened: usize,
    commits_at_reopen: Vec<usize>,
}

impl Kernel {
    fn new(model: Model) -> Self {
        Self {
            regs: RegisterMap::default(),
            model,
            staged: HashMap::new(),
            committed: vec![None; SENSORS],
            busy_reads: 0,
            stall_on_trigger: None,
            stalled: false,
            stall_always: false,
            commits: Vec::new(),
            triggers: 0,
            reopened: 0,
            commits_at_reopen: Vec::new(),
        }
    }

    /// Keep the status busy from the `n`-th trigger until the link is reopened
    fn stall_on(mut self, n: usize) -> Self {
        self.stall_on_trigger = Some(n);
        self
    }

    fn commit(&mut self, sensor: usize) {
        let layout = CalibrationLayout::default();
        let n = layout.word_bytes() / 4;
        // base + 4 * chunk holds word n - 1 - chunk
        let mut bytes = Vec::with_capacity(n * 4);
        for i in 0..n {
            let addr = self.regs.calibration_base + 4 * (n - 1 - i) as u32;
            let word = self.staged.get(&addr).copied().unwrap_or(0);
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        let tap = CalibrationWord::from_bytes(bytes, layout).unwrap().tap();
        self.committed[sensor] = Some(tap);
        self.commits.push((sensor, tap));
    }

    /// Sensor words of one DMA row holding `weight` ones
    fn row(weight: u32, row_words: usize) -> Vec<u8> {
        let mut row = Vec::with_capacity(row_words * 4);
        for i in 0..row_words as u32 {
            let ones = if i < 4 { weight.saturating_sub(32 * i).min(32) } else { 0 };
            let word = if ones == 0 { 0 } else { u32::MAX << (32 - ones) };
            row.extend_from_slice(&word.to_le_bytes());
        }
        row
    }
}

impl Link for Kernel {
    fn write(&mut self, _bytes: &[u8]) -> LinkResult<()> {
        Err(LinkError::Unsupported("byte writes"))
    }

    fn read(&mut self, buf: &mut [u8]) -> LinkResult<()> {
        let tap = self.committed[0].unwrap_or(DelayTap::new(0, 0));
        let (min, max) = (self.model)(tap);
        let mut dma = Vec::with_capacity(buf.len());
        for i in 0..SAMPLES {
            let weight = if i == 0 { max } else { min };
            dma.extend(Self::row(weight, self.regs.row_words));
        }
        buf.copy_from_slice(&dma[..buf.len()]);
        Ok(())
    }

    fn write_register(&mut self, addr: u32, value: u32) -> LinkResult<()> {
        if addr == self.regs.calibration_commit {
            self.commit(value as usize);
        } else if addr == self.regs.calibration_trigger {
            self.triggers += 1;
            self.busy_reads = 1;
            if self.stall_on_trigger == Some(self.triggers) {
                self.stalled = true;
            }
        } else {
            self.staged.insert(addr, value);
        }
        Ok(())
    }

    fn read_register(&mut self, addr: u32) -> LinkResult<u32> {
        if addr != self.regs.status {
            return Ok(0);
        }
        if self.stalled || self.stall_always {
            return Ok(0x01);
        }
        if self.busy_reads > 0 {
            self.busy_reads -= 1;
            return Ok(0x01);
        }
        Ok(self.regs.calibration_idle_mask)
    }

    fn reopen(&mut self) -> LinkResult<()> {
        self.reopened += 1;
        self.stalled = false;
        self.commits_at_reopen.push(self.commits.len());
        Ok(())
    }
}

fn board(kernel: Kernel) -> MappedBoard<Kernel> {
    let mut board = MappedBoard::new(
        kernel,
        MappedBoardConfig {
            sensors: SENSORS,
            samples: SAMPLES,
            sample_bytes: 16,
            poll_limit: 4,
            ..Default::default()
        },
    );
    board.connect().unwrap();
    board
}

/// Saturated below idc 2, floor-clipped until idf 5
fn model() -> Model {
    Box::new(|tap: DelayTap| {
        if tap.idc < 2 {
            (128, 128)
        } else if tap.idf >= 5 {
            (60, 90)
        } else {
            (10, 60)
        }
    })
}

fn all_sensors(tap: DelayTap) -> Vec<(usize, DelayTap)> {
    (0..SENSORS).map(|sensor| (sensor, tap)).collect()
}

#[test]
fn test_search_commits_every_sensor() {
    let mut board = board(Kernel::new(model()));
    let report = Calibrator::new(&mut board, SearchParams::default(), RetryPolicy::immediate(3))
        .run(&CalibrationMode::CoarseFine, None)
        .unwrap();

    let accepted = DelayTap::new(2, 5);
    assert_eq!(report.tap, Some(accepted));
    assert_eq!(report.words.len(), SENSORS);

    let kernel = board.link();
    assert_eq!(kernel.committed, vec![Some(accepted); SENSORS]);
    // every tap tried reached all sensors, in sensor order
    let mut expected = Vec::new();
    expected.extend(all_sensors(DelayTap::new(0, 0)));
    expected.extend(all_sensors(DelayTap::new(1, 0)));
    for idf in 0..=5 {
        expected.extend(all_sensors(DelayTap::new(2, idf)));
    }
    expected.extend(all_sensors(accepted));
    assert_eq!(kernel.commits, expected);

    // 10 + 10 saturated, 1 to break, 5 below the floor, 10 to accept
    assert_eq!(kernel.triggers, 36);
}

#[test]
fn test_capture_poll_timeout_is_retryable() {
    let mut board = board(Kernel::new(model()).stall_on(1));
    let stimulus = SearchParams::default().stimulus;

    let err = board.capture_calibration_trace(&stimulus).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.step(), Some(Step::CaptureCalibration));
    assert!(matches!(
        err,
        Error::Link {
            source: LinkError::PollTimeout { polls: 4, last: 0x01 },
            ..
        }
    ));
}

#[test]
fn test_stalled_capture_resumes_after_reopen() {
    // 20 saturated, 1 to break at (2, 0), then (2, 0)..(2, 3): trigger 26 is (2, 4)
    let mut board = board(Kernel::new(model()).stall_on(26));
    let report = Calibrator::new(&mut board, SearchParams::default(), RetryPolicy::immediate(3))
        .run(&CalibrationMode::CoarseFine, None)
        .unwrap();
    assert_eq!(report.tap, Some(DelayTap::new(2, 5)));
    assert_eq!(report.failures, 1);

    let kernel = board.link();
    assert_eq!(kernel.reopened, 1);
    assert_eq!(kernel.triggers, 37);

    // reconnect restores the cached words, then the search pushes the tap again
    let at = kernel.commits_at_reopen[0];
    let mut replay = all_sensors(DelayTap::new(2, 4));
    replay.extend(all_sensors(DelayTap::new(2, 4)));
    assert_eq!(&kernel.commits[at..at + 2 * SENSORS], &replay[..]);
}

#[test]
fn test_kernel_that_never_settles_aborts_calibration() {
    let mut kernel = Kernel::new(model());
    kernel.stall_always = true;
    let mut board = board(kernel);

    let params = SearchParams {
        max_failures: 2,
        ..Default::default()
    };
    let err = Calibrator::new(&mut board, params, RetryPolicy::immediate(3))
        .run(&CalibrationMode::Coarse, None)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Link {
            step: Step::CaptureCalibration,
            source: LinkError::PollTimeout { .. },
        }
    ));
    assert_eq!(board.link().reopened, 2);
    assert_eq!(board.link().triggers, 3);
}
