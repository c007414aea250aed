// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! Board drivers
//!
//! A [`Board`] turns the raw [`Link`] into the operations the calibration
//! engine and the acquisition session need. Two families exist:
//!
//! - [`StreamBoard`]: byte-stream command protocol (UART / USB), one sensor,
//!   optional masks, trace frames carrying an auxiliary signal word.
//! - [`MappedBoard`]: memory-mapped register kernel (PCIe), several sensors,
//!   status polling, trace rows read from a DMA buffer.
//!
//! Both cache the calibration words they were given so that a reconnect can
//! restore the sensor setting without involving the caller.

use crate::crypto::Block;
use crate::decoder::Trace;
use crate::error::{LinkError, Step, StepExt};
use crate::link::{Link, LinkResult};
use crate::protocol::{self, control, AddressSpace, FrameLayout};
use crate::registers::{block_to_words, words_to_block, RegisterMap};
use crate::thermometer::CalibrationWord;
use crate::{Error, Result};
use tracing::{debug, info};

/// Key and plaintext used to excite the sensor during calibration captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stimulus {
    pub key: Block,
    pub plaintext: Block,
}

/// Operations every sensor rig provides
pub trait Board {
    /// Number of sensor instances behind this board
    fn sensor_count(&self) -> usize;

    /// Whether masks can be loaded before an encryption
    fn supports_masks(&self) -> bool;

    /// One-time setup on a freshly opened link
    fn connect(&mut self) -> Result<()>;

    /// Close and reopen the link, then redo the one-time setup and restore
    /// every calibration word previously written
    fn reconnect(&mut self) -> Result<()>;

    /// Per-trace reset of the cipher core
    fn reset(&mut self) -> Result<()>;

    fn set_key(&mut self, key: &Block) -> Result<()>;

    fn set_mask(&mut self, mask: &Block) -> Result<()>;

    /// Load the plaintext and start the encryption
    fn send_plaintext(&mut self, plaintext: &Block) -> Result<()>;

    /// Block until the board reports the encryption as finished
    fn wait_done(&mut self) -> Result<()>;

    fn read_cipher(&mut self) -> Result<Block>;

    fn read_trace(&mut self) -> Result<Trace>;

    /// Write and commit a calibration word to one sensor
    fn write_calibration(&mut self, sensor: usize, word: &CalibrationWord) -> Result<()>;

    /// Record one trace for the calibration search under the current setting
    fn capture_calibration_trace(&mut self, stimulus: &Stimulus) -> Result<Trace>;
}

impl<B: Board + ?Sized> Board for Box<B> {
    fn sensor_count(&self) -> usize {
        (**self).sensor_count()
    }
    fn supports_masks(&self) -> bool {
        (**self).supports_masks()
    }
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }
    fn reconnect(&mut self) -> Result<()> {
        (**self).reconnect()
    }
    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }
    fn set_key(&mut self, key: &Block) -> Result<()> {
        (**self).set_key(key)
    }
    fn set_mask(&mut self, mask: &Block) -> Result<()> {
        (**self).set_mask(mask)
    }
    fn send_plaintext(&mut self, plaintext: &Block) -> Result<()> {
        (**self).send_plaintext(plaintext)
    }
    fn wait_done(&mut self) -> Result<()> {
        (**self).wait_done()
    }
    fn read_cipher(&mut self) -> Result<Block> {
        (**self).read_cipher()
    }
    fn read_trace(&mut self) -> Result<Trace> {
        (**self).read_trace()
    }
    fn write_calibration(&mut self, sensor: usize, word: &CalibrationWord) -> Result<()> {
        (**self).write_calibration(sensor, word)
    }
    fn capture_calibration_trace(&mut self, stimulus: &Stimulus) -> Result<Trace> {
        (**self).capture_calibration_trace(stimulus)
    }
}

fn check_sensor(sensor: usize, count: usize) -> Result<()> {
    if sensor >= count {
        return Err(Error::Config(format!(
            "sensor index {} out of range, board has {} sensor(s)",
            sensor, count
        )));
    }
    Ok(())
}

/// Parameters of a byte-stream board
#[derive(Debug, Clone)]
pub struct StreamBoardConfig {
    pub addresses: AddressSpace,
    pub frame: FrameLayout,
    /// Samples per trace frame
    pub samples: usize,
    /// Sensor bytes kept per sample, taken from the end of the sensor field
    pub sample_bytes: usize,
    /// Clock selection sent at connect time
    pub frequency_mode: Option<u8>,
}

impl Default for StreamBoardConfig {
    fn default() -> Self {
        Self {
            addresses: AddressSpace::default(),
            frame: FrameLayout::default(),
            samples: 256,
            sample_bytes: 16,
            frequency_mode: None,
        }
    }
}

/// Board speaking the byte-stream command protocol
pub struct StreamBoard<L: Link> {
    link: L,
    config: StreamBoardConfig,
    calibration: Option<CalibrationWord>,
}

impl<L: Link> StreamBoard<L> {
    pub fn new(link: L, config: StreamBoardConfig) -> Self {
        Self {
            link,
            config,
            calibration: None,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn setup(&mut self) -> LinkResult<()> {
        let addr = self.config.addresses;
        self.link.write(&[addr.reset_loop])?;
        if let Some(mode) = self.config.frequency_mode {
            protocol::write_command(&mut self.link, addr.frequency, mode)?;
        }
        protocol::write_command(&mut self.link, addr.control, control::CALIBRATE)
    }

    fn trim_sample(&self, sensor: Vec<u8>) -> Vec<u8> {
        let field = self.config.frame.sensor_bytes;
        let keep = self.config.sample_bytes.min(field);
        if keep == field {
            return sensor;
        }
        sensor
            .chunks_exact(field)
            .flat_map(|row| row[field - keep..].iter().copied())
            .collect()
    }
}

impl<L: Link> Board for StreamBoard<L> {
    fn sensor_count(&self) -> usize {
        1
    }

    fn supports_masks(&self) -> bool {
        true
    }

    fn connect(&mut self) -> Result<()> {
        self.setup().during(Step::Connect)?;
        debug!("Byte-stream board initialised");
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.link.reopen().during(Step::Reconnect)?;
        self.setup().during(Step::Reconnect)?;
        if let Some(word) = self.calibration.clone() {
            protocol::write_payload(&mut self.link, self.config.addresses.calibration, word.as_bytes())
                .during(Step::WriteCalibration)?;
            debug!("Restored calibration word {}", word);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        protocol::write_command(&mut self.link, self.config.addresses.control, control::RESET_AES)
            .during(Step::Reset)
    }

    fn set_key(&mut self, key: &Block) -> Result<()> {
        protocol::write_payload(&mut self.link, self.config.addresses.key, key).during(Step::SetKey)
    }

    fn set_mask(&mut self, mask: &Block) -> Result<()> {
        protocol::write_payload(&mut self.link, self.config.addresses.mask, mask).during(Step::SetMask)
    }

    fn send_plaintext(&mut self, plaintext: &Block) -> Result<()> {
        protocol::write_payload(&mut self.link, self.config.addresses.plaintext, plaintext)
            .during(Step::SendPlaintext)
    }

    fn wait_done(&mut self) -> Result<()> {
        protocol::expect_sentinel(&mut self.link, self.config.addresses.done_sentinel).during(Step::WaitDone)
    }

    fn read_cipher(&mut self) -> Result<Block> {
        let mut cipher = [0u8; 16];
        protocol::read_payload(&mut self.link, self.config.addresses.cipher, &mut cipher)
            .during(Step::ReadCipher)?;
        Ok(cipher)
    }

    fn read_trace(&mut self) -> Result<Trace> {
        let frame = self.config.frame;
        let mut buf = vec![0u8; frame.stride() * self.config.samples];
        protocol::read_payload(&mut self.link, self.config.addresses.trace, &mut buf).during(Step::ReadTrace)?;

        let (sensor, aux) = protocol::split_frames(&buf, frame);
        let data = self.trim_sample(sensor);
        Ok(Trace::new(data, self.config.sample_bytes.min(frame.sensor_bytes)).with_aux(aux))
    }

    fn write_calibration(&mut self, sensor: usize, word: &CalibrationWord) -> Result<()> {
        check_sensor(sensor, 1)?;
        protocol::write_payload(&mut self.link, self.config.addresses.calibration, word.as_bytes())
            .during(Step::WriteCalibration)?;
        self.calibration = Some(word.clone());
        Ok(())
    }

    fn capture_calibration_trace(&mut self, stimulus: &Stimulus) -> Result<Trace> {
        self.reset().map_err(|e| retag(e, Step::CaptureCalibration))?;
        self.set_key(&stimulus.key)
            .and_then(|_| self.send_plaintext(&stimulus.plaintext))
            .and_then(|_| self.wait_done())
            .and_then(|_| self.read_cipher())
            .map_err(|e| retag(e, Step::CaptureCalibration))?;
        self.read_trace().map_err(|e| retag(e, Step::CaptureCalibration))
    }
}

/// Report a link failure inside a composite operation under that operation's step
fn retag(err: Error, step: Step) -> Error {
    match err {
        Error::Link { source, .. } => Error::Link { step, source },
        other => other,
    }
}

/// Parameters of a register-mapped board
#[derive(Debug, Clone)]
pub struct MappedBoardConfig {
    pub registers: RegisterMap,
    pub sensors: usize,
    /// Sample rows per trace
    pub samples: usize,
    /// Sensor bytes per sample (a multiple of 4)
    pub sample_bytes: usize,
    /// Device address of the DMA dump buffer
    pub dump_pointer: Option<u64>,
    /// Status reads before a wait is reported as a timeout
    pub poll_limit: u32,
}

impl Default for MappedBoardConfig {
    fn default() -> Self {
        Self {
            registers: RegisterMap::default(),
            sensors: 1,
            samples: 256,
            sample_bytes: 64,
            dump_pointer: None,
            poll_limit: 1_000_000,
        }
    }
}

/// Board exposing the acquisition kernel through 32-bit registers
///
/// [`Link::read`] on the underlying transport returns the synchronised DMA
/// buffer as little-endian words.
pub struct MappedBoard<L: Link> {
    link: L,
    config: MappedBoardConfig,
    calibration: Vec<Option<CalibrationWord>>,
}

impl<L: Link> MappedBoard<L> {
    pub fn new(link: L, config: MappedBoardConfig) -> Self {
        let sensors = config.sensors;
        Self {
            link,
            config,
            calibration: vec![None; sensors],
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    fn setup(&mut self) -> LinkResult<()> {
        let regs = self.config.registers;
        self.link.write_register(regs.reset, 0)?;
        if let Some(ptr) = self.config.dump_pointer {
            self.link.write_register(regs.dump_pointer, ptr as u32)?;
            self.link.write_register(regs.dump_pointer + 4, (ptr >> 32) as u32)?;
        }
        Ok(())
    }

    fn write_block(&mut self, base: u32, block: &Block) -> LinkResult<()> {
        let words = block_to_words(block);
        for (chunk, addr) in RegisterMap::block_slots(base) {
            self.link.write_register(addr, words[chunk])?;
        }
        Ok(())
    }

    fn poll(&mut self, mask: u32, pattern: u32) -> LinkResult<()> {
        let status = self.config.registers.status;
        let mut last = 0;
        for _ in 0..self.config.poll_limit {
            last = self.link.read_register(status)?;
            if last & mask == pattern {
                return Ok(());
            }
        }
        Err(LinkError::PollTimeout {
            polls: self.config.poll_limit,
            last,
        })
    }

    fn send_word(&mut self, sensor: usize, word: &CalibrationWord) -> LinkResult<()> {
        let regs = self.config.registers;
        let words = word.to_words();
        let n = words.len();
        for chunk in 0..n {
            self.link
                .write_register(regs.calibration_base + 4 * chunk as u32, words[n - 1 - chunk])?;
        }
        self.link.write_register(regs.calibration_commit, sensor as u32)
    }

    fn read_rows(&mut self) -> LinkResult<Trace> {
        let row_words = self.config.registers.row_words;
        let sample_words = (self.config.sample_bytes / 4).min(row_words);
        let mut buf = vec![0u8; self.config.samples * row_words * 4];
        self.link.read(&mut buf)?;

        let mut data = Vec::with_capacity(self.config.samples * sample_words * 4);
        for row in buf.chunks_exact(row_words * 4) {
            for word in row.chunks_exact(4).take(sample_words) {
                let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                data.extend_from_slice(&value.to_be_bytes());
            }
        }
        Ok(Trace::new(data, sample_words * 4))
    }
}

impl<L: Link> Board for MappedBoard<L> {
    fn sensor_count(&self) -> usize {
        self.config.sensors
    }

    fn supports_masks(&self) -> bool {
        false
    }

    fn connect(&mut self) -> Result<()> {
        self.setup().during(Step::Connect)?;
        info!(
            "Register-mapped board initialised ({} sensor(s), dump pointer {:?})",
            self.config.sensors, self.config.dump_pointer
        );
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.link.reopen().during(Step::Reconnect)?;
        self.setup().during(Step::Reconnect)?;
        let cached: Vec<(usize, CalibrationWord)> = self
            .calibration
            .iter()
            .enumerate()
            .filter_map(|(i, w)| w.clone().map(|w| (i, w)))
            .collect();
        for (sensor, word) in cached {
            self.send_word(sensor, &word).during(Step::WriteCalibration)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        // the kernel returns to idle on its own after each dump
        Ok(())
    }

    fn set_key(&mut self, key: &Block) -> Result<()> {
        let regs = self.config.registers;
        self.write_block(regs.key_base, key)
            .and_then(|_| self.link.write_register(regs.set_key, 0))
            .during(Step::SetKey)
    }

    fn set_mask(&mut self, _mask: &Block) -> Result<()> {
        Err(Error::link(Step::SetMask, LinkError::Unsupported("masks on register-mapped boards")))
    }

    fn send_plaintext(&mut self, plaintext: &Block) -> Result<()> {
        let regs = self.config.registers;
        self.write_block(regs.plaintext_base, plaintext)
            .and_then(|_| self.link.write_register(regs.start, 0))
            .during(Step::SendPlaintext)
    }

    fn wait_done(&mut self) -> Result<()> {
        let regs = self.config.registers;
        self.poll(regs.trace_idle_mask, regs.trace_done_pattern).during(Step::WaitDone)
    }

    fn read_cipher(&mut self) -> Result<Block> {
        let base = self.config.registers.ciphertext;
        let mut words = [0u32; 4];
        for (chunk, addr) in RegisterMap::block_slots(base) {
            words[chunk] = self.link.read_register(addr).during(Step::ReadCipher)?;
        }
        Ok(words_to_block(&words))
    }

    fn read_trace(&mut self) -> Result<Trace> {
        self.read_rows().during(Step::ReadTrace)
    }

    fn write_calibration(&mut self, sensor: usize, word: &CalibrationWord) -> Result<()> {
        check_sensor(sensor, self.config.sensors)?;
        self.send_word(sensor, word).during(Step::WriteCalibration)?;
        self.calibration[sensor] = Some(word.clone());
        Ok(())
    }

    fn capture_calibration_trace(&mut self, _stimulus: &Stimulus) -> Result<Trace> {
        let regs = self.config.registers;
        self.link
            .write_register(regs.calibration_trigger, regs.calibration_trigger_value)
            .and_then(|_| self.poll(regs.calibration_idle_mask, regs.calibration_idle_mask))
            .and_then(|_| self.read_rows())
            .during(Step::CaptureCalibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thermometer::{pack_calibration_word, CalibrationLayout, DelayTap};
    use std::collections::{HashMap, VecDeque};

    /// Register file that records writes and serves scripted status values
    #[derive(Default)]
    struct RegisterFile {
        writes: Vec<(u32, u32)>,
        values: HashMap<u32, u32>,
        status: VecDeque<u32>,
        dma: Vec<u8>,
        reopened: usize,
    }

    impl Link for RegisterFile {
        fn write(&mut self, _bytes: &[u8]) -> LinkResult<()> {
            Err(LinkError::Unsupported("byte writes"))
        }

        fn read(&mut self, buf: &mut [u8]) -> LinkResult<()> {
            buf.copy_from_slice(&self.dma[..buf.len()]);
            Ok(())
        }

        fn write_register(&mut self, addr: u32, value: u32) -> LinkResult<()> {
            self.writes.push((addr, value));
            Ok(())
        }

        fn read_register(&mut self, addr: u32) -> LinkResult<u32> {
            if addr == 0 {
                return Ok(self.status.pop_front().unwrap_or(0));
            }
            Ok(*self.values.get(&addr).unwrap_or(&0))
        }

        fn reopen(&mut self) -> LinkResult<()> {
            self.reopened += 1;
            Ok(())
        }
    }

    fn mapped(link: RegisterFile) -> MappedBoard<RegisterFile> {
        MappedBoard::new(
            link,
            MappedBoardConfig {
                sensors: 2,
                samples: 2,
                sample_bytes: 8,
                dump_pointer: Some(0x1_2345_6780),
                poll_limit: 4,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_mapped_connect_writes_dump_pointer() {
        let mut board = mapped(RegisterFile::default());
        board.connect().unwrap();
        assert_eq!(board.link().writes, vec![(0x100, 0), (0x200, 0x2345_6780), (0x204, 0x1)]);
    }

    #[test]
    fn test_mapped_key_word_order() {
        let mut board = mapped(RegisterFile::default());
        let mut key = [0u8; 16];
        key[0] = 0xAA;
        key[15] = 0x55;
        board.set_key(&key).unwrap();
        assert_eq!(
            board.link().writes,
            vec![(0x30C, 0xAA00_0000), (0x308, 0), (0x304, 0), (0x300, 0x55), (0x900, 0)]
        );
    }

    #[test]
    fn test_mapped_calibration_is_written_reversed_then_committed() {
        let mut board = mapped(RegisterFile::default());
        let word = pack_calibration_word(DelayTap::new(1, 33), CalibrationLayout::default()).unwrap();
        board.write_calibration(1, &word).unwrap();
        assert_eq!(
            board.link().writes,
            vec![
                (0x500, 0x8000_0000),
                (0x504, 0),
                (0x508, 0x8000_0000),
                (0x50C, 0xFFFF_FFFF),
                (0x600, 1)
            ]
        );
        assert!(board.write_calibration(2, &word).is_err());
    }

    #[test]
    fn test_mapped_wait_times_out() {
        let mut link = RegisterFile::default();
        link.status = VecDeque::from(vec![0x20, 0x23, 0x23, 0x23, 0x03]);
        let mut board = mapped(link);
        let err = board.wait_done().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.step(), Some(Step::WaitDone));
    }

    #[test]
    fn test_mapped_trace_rows() {
        let mut link = RegisterFile::default();
        // two rows of 16 words, the first two words of each row are sensor data
        let mut dma = vec![0u8; 2 * 64];
        dma[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        dma[64..68].copy_from_slice(&0x0000_000Fu32.to_le_bytes());
        dma[68..72].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        dma[8..12].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // outside the sensor words
        link.dma = dma;
        let mut board = mapped(link);

        let trace = board.read_trace().unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.weights(), vec![32, 5]);
    }

    #[test]
    fn test_mapped_reconnect_restores_calibration() {
        let mut board = mapped(RegisterFile::default());
        let word = pack_calibration_word(DelayTap::new(4, 0), CalibrationLayout::default()).unwrap();
        board.write_calibration(0, &word).unwrap();
        board.link.writes.clear();

        board.reconnect().unwrap();
        assert_eq!(board.link().reopened, 1);
        assert_eq!(board.link().writes.last(), Some(&(0x600, 0)));
        assert!(board.link().writes.contains(&(0x500, 0xF000_0000)));
    }

    #[test]
    fn test_mapped_masks_are_fatal() {
        let mut board = mapped(RegisterFile::default());
        let err = board.set_mask(&[0; 16]).unwrap_err();
        assert!(!err.is_retryable());
    }
}
