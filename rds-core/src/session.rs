// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! Acquisition session
//!
//! Each trace walks `Idle -> Armed -> Triggered -> Collected -> Dumped`. Any
//! link failure on the way moves the session to `Failed`: the board is
//! reconnected, the cipher state is restored from the snapshot taken when the
//! trace was armed, and the same trace index is attempted again. A trace index
//! is never dumped twice and never skipped.
//!
//! The number of consecutive failures of one trace is bounded; exceeding the
//! bound ends the session with [`Error::RetriesExhausted`].

use crate::board::Board;
use crate::crypto::{random_block, Block, ReferenceCipher};
use crate::decoder::Trace;
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::sinks::TraceSink;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-trace state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Armed,
    Triggered,
    Collected,
    Dumped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMode {
    Constant(Block),
    /// Fresh random key for every trace
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaintextMode {
    /// Same plaintext for every trace
    Constant,
    /// Next plaintext is the previous ciphertext
    Chained,
    /// Alternate between the chain and a fixed reference plaintext
    TTest { fixed: Block },
}

/// Which plaintext policy produced a trace's plaintext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaintextSource {
    Constant,
    Chained,
    Fixed,
}

/// Values exchanged with the hardware cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CryptoState {
    pub key: Block,
    pub plaintext: Block,
    pub cipher: Block,
    /// Last ciphertext of a chained encryption (t-test mode only)
    pub cipher_chained: Block,
}

/// Snapshot taken before a trace touches the link
#[derive(Debug, Clone, Copy)]
pub struct RecoveryState {
    crypto: CryptoState,
    chained: bool,
}

/// Everything captured for one trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub index: u64,
    pub key: Block,
    pub masks: Vec<Block>,
    pub plaintext: Block,
    pub cipher: Block,
    pub trace: Trace,
    pub source: PlaintextSource,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub num_traces: u64,
    pub key_mode: KeyMode,
    pub plaintext_mode: PlaintextMode,
    pub initial_plaintext: Block,
    pub mask_count: usize,
    /// Failed attempts allowed for a single trace before giving up
    pub max_retries_per_trace: u32,
    /// Emit an info line every this many traces
    pub progress_every: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_traces: 1,
            key_mode: KeyMode::Constant([0u8; 16]),
            plaintext_mode: PlaintextMode::Chained,
            initial_plaintext: [0u8; 16],
            mask_count: 0,
            max_retries_per_trace: 10,
            progress_every: 1000,
        }
    }
}

/// Final report of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub requested: u64,
    pub traces: u64,
    pub fails: u64,
    pub mismatches: u64,
    pub elapsed_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stopped_early: bool,
}

impl SessionSummary {
    /// Summary of a session stopped before its first trace, e.g. during
    /// calibration
    pub fn stopped_before_start(requested: u64, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        let elapsed = (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        Self {
            requested,
            traces: 0,
            fails: 0,
            mismatches: 0,
            elapsed_secs: elapsed,
            started_at,
            finished_at,
            stopped_early: true,
        }
    }
}

/// Drives a board through `num_traces` encryptions
pub struct AcquisitionSession<B, S, C, R>
where
    B: Board,
    S: TraceSink,
    C: ReferenceCipher,
    R: RngCore,
{
    board: B,
    sink: S,
    cipher: C,
    rng: R,
    config: SessionConfig,
    policy: RetryPolicy,
    metrics: Metrics,
    stop: Option<Arc<AtomicBool>>,

    state: State,
    crypto: CryptoState,
    chained: bool,
    recovery: Option<RecoveryState>,
    fails: u64,
    mismatches: u64,
}

impl<B, S, C, R> AcquisitionSession<B, S, C, R>
where
    B: Board,
    S: TraceSink,
    C: ReferenceCipher,
    R: RngCore,
{
    pub fn new(board: B, sink: S, cipher: C, rng: R, config: SessionConfig) -> Self {
        let key = match &config.key_mode {
            KeyMode::Constant(key) => *key,
            KeyMode::Random => [0u8; 16],
        };
        let crypto = CryptoState {
            key,
            plaintext: config.initial_plaintext,
            ..Default::default()
        };
        Self {
            board,
            sink,
            cipher,
            rng,
            config,
            policy: RetryPolicy::default(),
            metrics: Metrics::new(),
            stop: None,
            state: State::Idle,
            crypto,
            chained: true,
            recovery: None,
            fails: 0,
            mismatches: 0,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Finish the current trace and stop once `flag` is set
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn crypto(&self) -> &CryptoState {
        &self.crypto
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_parts(self) -> (B, S) {
        (self.board, self.sink)
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Run until `num_traces` traces are dumped, a fatal error occurs or a
    /// stop is requested
    pub fn run(&mut self) -> Result<SessionSummary> {
        let started_at = Utc::now();
        let start = Instant::now();
        let total = self.config.num_traces;
        let mut index = 0u64;
        let mut retries = 0u32;
        let mut stopped_early = false;

        info!("Starting acquisition of {} traces", total);

        while index < total {
            if self.stop_requested() {
                warn!("Stop requested, ending session after {} traces", index);
                stopped_early = true;
                break;
            }

            let began = Instant::now();
            match self.acquire(index) {
                Ok(record) => {
                    self.dump(&record, began)?;
                    index += 1;
                    retries = 0;

                    if index % self.config.progress_every.max(1) == 0 || index == total {
                        info!("Trace {}/{} ({} fails so far)", index, total, self.fails);
                    }
                }
                Err(e) if e.is_retryable() => {
                    self.state = State::Failed;
                    self.fails += 1;
                    retries += 1;
                    self.metrics.record_failure();
                    warn!("Trace {} failed: {}", index, e);

                    if retries > self.config.max_retries_per_trace {
                        return Err(Error::RetriesExhausted {
                            index,
                            attempts: retries,
                            source: Box::new(e),
                        });
                    }
                    self.recover()?;
                }
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }

        self.sink.flush()?;

        let finished_at = Utc::now();
        let elapsed = start.elapsed().as_secs_f64();
        info!(
            "Recorded {} traces in {:.1}s, {} fails, {} mismatches",
            index, elapsed, self.fails, self.mismatches
        );

        Ok(SessionSummary {
            requested: total,
            traces: index,
            fails: self.fails,
            mismatches: self.mismatches,
            elapsed_secs: elapsed,
            started_at,
            finished_at,
            stopped_early,
        })
    }

    /// `Idle` through `Collected` for one trace
    fn acquire(&mut self, index: u64) -> Result<TraceRecord> {
        self.recovery = Some(RecoveryState {
            crypto: self.crypto,
            chained: self.chained,
        });

        if self.config.key_mode == KeyMode::Random {
            self.crypto.key = random_block(&mut self.rng);
        }
        let masks: Vec<Block> = (0..self.config.mask_count)
            .map(|_| random_block(&mut self.rng))
            .collect();
        self.board.reset()?;
        self.state = State::Armed;

        self.board.set_key(&self.crypto.key)?;
        for mask in &masks {
            self.board.set_mask(mask)?;
        }
        self.state = State::Triggered;

        self.crypto.cipher = [0u8; 16];
        self.board.send_plaintext(&self.crypto.plaintext)?;
        self.board.wait_done()?;
        self.crypto.cipher = self.board.read_cipher()?;
        let trace = self.board.read_trace()?;
        self.state = State::Collected;

        Ok(TraceRecord {
            index,
            key: self.crypto.key,
            masks,
            plaintext: self.crypto.plaintext,
            cipher: self.crypto.cipher,
            trace,
            source: self.source(),
        })
    }

    fn source(&self) -> PlaintextSource {
        match self.config.plaintext_mode {
            PlaintextMode::Constant => PlaintextSource::Constant,
            PlaintextMode::Chained => PlaintextSource::Chained,
            PlaintextMode::TTest { .. } if self.chained => PlaintextSource::Chained,
            PlaintextMode::TTest { .. } => PlaintextSource::Fixed,
        }
    }

    /// `Collected -> Dumped`
    fn dump(&mut self, record: &TraceRecord, began: Instant) -> Result<()> {
        let expected = self.cipher.encrypt(&record.plaintext, &record.key);
        if expected != record.cipher {
            self.mismatches += 1;
            self.metrics.record_mismatch();
            let err = Error::SoftHardMismatch {
                index: record.index,
                expected: hex::encode(expected),
                actual: hex::encode(record.cipher),
            };
            warn!("{}", err);
        }

        let bytes = self.sink.append(record)?;
        debug!(
            "Trace {}: key={} pt={} ct={}",
            record.index,
            hex::encode(record.key),
            hex::encode(record.plaintext),
            hex::encode(record.cipher)
        );

        self.advance_plaintext();
        self.recovery = None;
        self.state = State::Dumped;
        self.metrics
            .record_trace(bytes, began.elapsed().as_micros() as u64);
        self.state = State::Idle;
        Ok(())
    }

    fn advance_plaintext(&mut self) {
        match self.config.plaintext_mode {
            PlaintextMode::Constant => {}
            PlaintextMode::Chained => self.crypto.plaintext = self.crypto.cipher,
            PlaintextMode::TTest { fixed } => {
                if self.chained {
                    self.crypto.cipher_chained = self.crypto.cipher;
                    self.crypto.plaintext = fixed;
                    self.chained = false;
                } else {
                    self.crypto.plaintext = self.crypto.cipher_chained;
                    self.chained = true;
                }
            }
        }
    }

    /// `Failed -> Idle`
    fn recover(&mut self) -> Result<()> {
        if let Some(snapshot) = self.recovery.take() {
            self.crypto = snapshot.crypto;
            self.chained = snapshot.chained;
        }

        let board = &mut self.board;
        self.policy.execute(|| board.reconnect())?;
        self.metrics.record_reconnect();
        info!("Link re-established, retrying");
        self.state = State::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{StreamBoard, StreamBoardConfig};
    use crate::crypto::{Aes128Reference, XorCipher};
    use crate::protocol::AddressSpace;
    use crate::sim::{SimConfig, SimulatedDevice};
    use crate::sinks::MemorySink;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type SimBoard = StreamBoard<SimulatedDevice>;

    fn sim_board(device: SimulatedDevice) -> SimBoard {
        let mut board = StreamBoard::new(
            device,
            StreamBoardConfig {
                samples: 4,
                ..Default::default()
            },
        );
        board.connect().unwrap();
        board
    }

    fn device() -> SimulatedDevice {
        SimulatedDevice::new(
            SimConfig {
                samples: 4,
                ..Default::default()
            },
            Box::new(Aes128Reference),
            SimulatedDevice::default_model(128),
        )
    }

    fn session(
        board: SimBoard,
        config: SessionConfig,
    ) -> AcquisitionSession<SimBoard, MemorySink, Aes128Reference, StdRng> {
        AcquisitionSession::new(board, MemorySink::default(), Aes128Reference, StdRng::seed_from_u64(1), config)
            .with_retry_policy(RetryPolicy::immediate(3))
    }

    #[test]
    fn test_chained_plaintexts() {
        let mut s = session(
            sim_board(device()),
            SessionConfig {
                num_traces: 3,
                ..Default::default()
            },
        );
        let summary = s.run().unwrap();
        assert_eq!(summary.traces, 3);
        assert_eq!(summary.mismatches, 0);

        let records = &s.sink().records;
        assert_eq!(records[1].plaintext, records[0].cipher);
        assert_eq!(records[2].plaintext, records[1].cipher);
        assert_eq!(s.state(), State::Idle);
        assert_eq!(s.sink().flushes, 1);
    }

    #[test]
    fn test_constant_plaintext_and_random_keys() {
        let mut s = session(
            sim_board(device()),
            SessionConfig {
                num_traces: 4,
                key_mode: KeyMode::Random,
                plaintext_mode: PlaintextMode::Constant,
                initial_plaintext: [7; 16],
                ..Default::default()
            },
        );
        s.run().unwrap();
        let records = &s.sink().records;
        assert!(records.iter().all(|r| r.plaintext == [7; 16]));
        assert_ne!(records[0].key, records[1].key);
        assert!(records.iter().all(|r| r.source == PlaintextSource::Constant));
    }

    #[test]
    fn test_masks_are_sent_and_recorded() {
        let mut s = session(
            sim_board(device()),
            SessionConfig {
                num_traces: 2,
                mask_count: 2,
                ..Default::default()
            },
        );
        s.run().unwrap();
        let last = s.sink().records.last().unwrap().clone();
        assert_eq!(last.masks.len(), 2);
        // masks of the last trace are the ones the device still holds
        let (board, _) = s.into_parts();
        assert_eq!(board.link().masks().len(), 2);
    }

    #[test]
    fn test_mismatch_is_not_fatal() {
        // board computes XOR, reference computes AES
        let dev = SimulatedDevice::new(
            SimConfig {
                samples: 4,
                ..Default::default()
            },
            Box::new(XorCipher),
            SimulatedDevice::default_model(128),
        );
        let mut s = session(
            sim_board(dev),
            SessionConfig {
                num_traces: 3,
                ..Default::default()
            },
        );
        let summary = s.run().unwrap();
        assert_eq!(summary.traces, 3);
        assert_eq!(summary.mismatches, 3);
    }

    #[test]
    fn test_plaintext_restored_after_failure() {
        let dev = device().fail_on_address(AddressSpace::default().plaintext, 2);
        let mut s = session(
            sim_board(dev),
            SessionConfig {
                num_traces: 2,
                plaintext_mode: PlaintextMode::Chained,
                ..Default::default()
            },
        );
        let summary = s.run().unwrap();
        assert_eq!(summary.fails, 1);

        let records = &s.sink().records;
        assert_eq!(records.len(), 2);
        // the retried trace still encrypts the chained plaintext
        assert_eq!(records[1].plaintext, records[0].cipher);
    }

    #[test]
    fn test_retry_ceiling() {
        let key = AddressSpace::default().key;
        let mut dev = device();
        for n in 2..=10 {
            dev = dev.fail_on_address(key, n);
        }
        let mut s = session(
            sim_board(dev),
            SessionConfig {
                num_traces: 5,
                max_retries_per_trace: 3,
                ..Default::default()
            },
        );
        let err = s.run().unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { index: 1, attempts: 4, .. }));
        assert_eq!(s.sink().records.len(), 1);
    }

    #[test]
    fn test_unrecoverable_link_is_fatal() {
        let dev = device()
            .fail_on_address(AddressSpace::default().key, 1)
            .fail_reopens(10);
        let mut s = session(
            sim_board(dev),
            SessionConfig {
                num_traces: 2,
                ..Default::default()
            },
        );
        let err = s.run().unwrap_err();
        assert_eq!(err.step(), Some(crate::error::Step::Reconnect));
        assert!(s.sink().records.is_empty());
    }

    #[test]
    fn test_stop_flag() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut s = session(
            sim_board(device()),
            SessionConfig {
                num_traces: 5,
                ..Default::default()
            },
        )
        .with_stop_flag(flag);
        let summary = s.run().unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.traces, 0);
        assert_eq!(s.sink().flushes, 1);
    }

    #[test]
    fn test_summary_for_session_that_never_started() {
        let started_at = Utc::now() - chrono::Duration::seconds(3);
        let summary = SessionSummary::stopped_before_start(1000, started_at);
        assert!(summary.stopped_early);
        assert_eq!(summary.requested, 1000);
        assert_eq!(summary.traces, 0);
        assert!(summary.elapsed_secs >= 3.0);
        assert!(summary.finished_at >= started_at);
    }
}
