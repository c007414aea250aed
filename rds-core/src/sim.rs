//! In-process byte-stream device for dry runs and tests
//!
//! [`SimulatedDevice`] implements [`Link`] and answers the byte-stream command
//! protocol the way the FPGA controller does: address echo, reversed payloads,
//! completion sentinel after each plaintext and 18-byte trace frames. The
//! sensor response is a function of the calibration tap last written, and
//! faults can be injected on chosen address writes.

use crate::crypto::{Block, ReferenceCipher};
use crate::error::LinkError;
use crate::link::{Link, LinkResult};
use crate::protocol::{control, AddressSpace, FrameLayout};
use crate::thermometer::{encode_thermometer, CalibrationLayout, CalibrationWord, DelayTap};
use std::collections::{HashMap, VecDeque};
use std::io;
use tracing::{debug, trace};

/// Minimum and maximum sample weight the sensor shows at a given tap
pub type SensorModel = Box<dyn Fn(DelayTap) -> (u32, u32) + Send>;

/// Raw auxiliary word reported with every sample (about 34 degrees Celsius)
pub const SIM_AUX_WORD: u16 = 2500;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub addresses: AddressSpace,
    pub frame: FrameLayout,
    pub layout: CalibrationLayout,
    pub samples: usize,
    /// Bytes at the end of each sensor field that carry the sensor register
    pub sample_bytes: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            addresses: AddressSpace::default(),
            frame: FrameLayout::default(),
            layout: CalibrationLayout::default(),
            samples: 256,
            sample_bytes: 16,
        }
    }
}

enum Parser {
    Idle,
    Command { prefix: u8 },
    Payload { address: u8, buf: Vec<u8>, expected: usize },
}

/// Simulated byte-stream board
pub struct SimulatedDevice {
    config: SimConfig,
    cipher: Box<dyn ReferenceCipher + Send>,
    model: SensorModel,

    parser: Parser,
    replies: VecDeque<u8>,
    hung: bool,

    key: Block,
    masks: Vec<Block>,
    last_cipher: Block,
    tap: DelayTap,
    frequency_mode: Option<u8>,

    faults: Vec<(u8, usize)>,
    address_counts: HashMap<u8, usize>,
    reopen_failures: u32,

    /// Tap in effect for every trace read so far
    pub captured_taps: Vec<DelayTap>,
    /// Every calibration word received, decoded
    pub written_taps: Vec<DelayTap>,
    /// Plaintexts received, in order
    pub plaintexts: Vec<Block>,
    pub reopen_count: usize,
}

impl SimulatedDevice {
    pub fn new(config: SimConfig, cipher: Box<dyn ReferenceCipher + Send>, model: SensorModel) -> Self {
        Self {
            config,
            cipher,
            model,
            parser: Parser::Idle,
            replies: VecDeque::new(),
            hung: false,
            key: [0u8; 16],
            masks: Vec::new(),
            last_cipher: [0u8; 16],
            tap: DelayTap::new(0, 0),
            frequency_mode: None,
            faults: Vec::new(),
            address_counts: HashMap::new(),
            reopen_failures: 0,
            captured_taps: Vec::new(),
            written_taps: Vec::new(),
            plaintexts: Vec::new(),
            reopen_count: 0,
        }
    }

    /// Stop answering on the `occurrence`-th write (1-based) of `address`
    /// until the link is reopened
    pub fn fail_on_address(mut self, address: u8, occurrence: usize) -> Self {
        self.faults.push((address, occurrence));
        self
    }

    /// Make the next `count` reopen attempts fail
    pub fn fail_reopens(mut self, count: u32) -> Self {
        self.reopen_failures = count;
        self
    }

    pub fn tap(&self) -> DelayTap {
        self.tap
    }

    pub fn frequency_mode(&self) -> Option<u8> {
        self.frequency_mode
    }

    pub fn masks(&self) -> &[Block] {
        &self.masks
    }

    /// Delay line that stays saturated below idc 6 and loses about 12 weight
    /// per coarse step and 1 per four fine steps after that
    pub fn default_model(sensor_width: u32) -> SensorModel {
        Box::new(move |tap: DelayTap| {
            let w = sensor_width as i64;
            if tap.idc < 6 {
                return (sensor_width, sensor_width);
            }
            let center = w - (tap.idc as i64 - 6) * 12 - (tap.idf as i64) / 4;
            let min = (center - 30).clamp(0, w) as u32;
            let max = (center + 10).clamp(0, w) as u32;
            (min, max)
        })
    }

    fn feed(&mut self, byte: u8) {
        let addr = self.config.addresses;
        match std::mem::replace(&mut self.parser, Parser::Idle) {
            Parser::Idle => {
                if self.trips_fault(byte) {
                    debug!("Simulated device hangs on address 0x{:02x}", byte);
                    self.hung = true;
                    return;
                }
                if byte == addr.reset_loop {
                    self.masks.clear();
                } else if byte == addr.control || byte == addr.frequency {
                    self.parser = Parser::Command { prefix: byte };
                } else if byte == addr.key || byte == addr.mask || byte == addr.plaintext {
                    self.replies.push_back(byte);
                    self.parser = Parser::Payload {
                        address: byte,
                        buf: Vec::with_capacity(16),
                        expected: 16,
                    };
                } else if byte == addr.calibration {
                    self.replies.push_back(byte);
                    let expected = self.config.layout.word_bytes();
                    self.parser = Parser::Payload {
                        address: byte,
                        buf: Vec::with_capacity(expected),
                        expected,
                    };
                } else if byte == addr.cipher {
                    self.replies.push_back(byte);
                    let cipher = self.last_cipher;
                    self.replies.extend(cipher.iter().rev());
                } else if byte == addr.trace {
                    self.replies.push_back(byte);
                    self.emit_trace();
                } else {
                    trace!("Simulated device ignores byte 0x{:02x}", byte);
                }
            }
            Parser::Command { prefix } => {
                if prefix == addr.frequency {
                    self.frequency_mode = Some(byte);
                } else if byte == control::RESET_AES {
                    self.masks.clear();
                } else if byte == control::CALIBRATE {
                    // hardware self-calibration overrides any written tap
                    self.tap = DelayTap::new(0, 0);
                }
            }
            Parser::Payload {
                address,
                mut buf,
                expected,
            } => {
                buf.push(byte);
                if buf.len() < expected {
                    self.parser = Parser::Payload { address, buf, expected };
                } else {
                    buf.reverse();
                    self.complete_payload(address, buf);
                }
            }
        }
    }

    fn trips_fault(&mut self, address: u8) -> bool {
        let count = self.address_counts.entry(address).or_insert(0);
        *count += 1;
        let count = *count;
        self.faults.iter().any(|&(a, n)| a == address && n == count)
    }

    fn complete_payload(&mut self, address: u8, payload: Vec<u8>) {
        let addr = self.config.addresses;
        if address == addr.calibration {
            if let Ok(word) = CalibrationWord::from_bytes(payload, self.config.layout) {
                self.tap = word.tap();
                self.written_taps.push(self.tap);
            }
            return;
        }

        let mut block = [0u8; 16];
        block.copy_from_slice(&payload);
        if address == addr.key {
            self.key = block;
        } else if address == addr.mask {
            self.masks.push(block);
        } else if address == addr.plaintext {
            self.plaintexts.push(block);
            self.last_cipher = self.cipher.encrypt(&block, &self.key);
            self.replies.push_back(addr.done_sentinel);
        }
    }

    fn sample(&self, weight: u32) -> Vec<u8> {
        let field = self.config.frame.sensor_bytes;
        let keep = self.config.sample_bytes.min(field);
        let mut sample = vec![0u8; field - keep];
        let code = encode_thermometer(weight.min(keep as u32 * 8), keep as u32 * 8)
            .map(|v| v.into_bytes())
            .unwrap_or_else(|_| vec![0u8; keep]);
        sample.extend_from_slice(&code);
        sample
    }

    fn emit_trace(&mut self) {
        let (min, max) = (self.model)(self.tap);
        self.captured_taps.push(self.tap);

        let mid = min + (max - min.min(max)) / 2;
        let [hi, lo] = SIM_AUX_WORD.to_be_bytes();
        for i in 0..self.config.samples {
            let weight = match i {
                0 => max,
                1 => min,
                _ => mid,
            };
            let sample = self.sample(weight);
            self.replies.extend(sample);
            if self.config.frame.aux_bytes >= 2 {
                self.replies.push_back(lo);
                self.replies.push_back(hi);
            }
        }
    }
}

impl Link for SimulatedDevice {
    fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        if self.hung {
            return Ok(());
        }
        for &b in bytes {
            self.feed(b);
            if self.hung {
                break;
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> LinkResult<()> {
        if self.hung {
            return Err(LinkError::Io(io::Error::new(io::ErrorKind::TimedOut, "device not responding")));
        }
        for b in buf.iter_mut() {
            *b = self
                .replies
                .pop_front()
                .ok_or_else(|| LinkError::Io(io::Error::new(io::ErrorKind::TimedOut, "read timed out")))?;
        }
        Ok(())
    }

    fn reopen(&mut self) -> LinkResult<()> {
        if self.reopen_failures > 0 {
            self.reopen_failures -= 1;
            return Err(LinkError::Io(io::Error::new(io::ErrorKind::NotFound, "device node missing")));
        }
        self.reopen_count += 1;
        self.hung = false;
        self.parser = Parser::Idle;
        self.replies.clear();
        Ok(())
    }
}
