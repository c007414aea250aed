//! Thermometer codec for the delay-line tap registers
//!
//! A tap count `n` in a `w`-bit field is written as `n` ones starting at the
//! most significant bit of the field's first byte, followed by zeros. The
//! calibration register concatenates the fine (IDF) field at the low byte
//! offsets and the coarse (IDC) field right after it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte patterns for a partially filled byte, indexed by the number of ones
const PARTIAL_BYTE: [u8; 8] = [0x00, 0x80, 0xC0, 0xE0, 0xF0, 0xF8, 0xFC, 0xFE];

/// Fixed-width bit vector, MSB-first within each byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitVector {
    bytes: Vec<u8>,
    width: u32,
}

impl BitVector {
    /// All-zero vector of `width` bits
    pub fn zeros(width: u32) -> Self {
        Self {
            bytes: vec![0u8; width.div_ceil(8) as usize],
            width,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total number of set bits
    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Number of consecutive ones from the most significant end
    pub fn leading_ones(&self) -> u32 {
        leading_ones(&self.bytes).min(self.width)
    }
}

/// Encode `count` as a thermometer code in a field of `width` bits
pub fn encode_thermometer(count: u32, width: u32) -> Result<BitVector> {
    if count > width {
        return Err(Error::InvalidCount { count, width });
    }

    let mut vector = BitVector::zeros(width);
    let full = (count / 8) as usize;
    vector.bytes[..full].fill(0xFF);

    let remainder = (count % 8) as usize;
    if remainder > 0 {
        vector.bytes[full] = PARTIAL_BYTE[remainder];
    }

    Ok(vector)
}

/// Count leading ones of a byte-packed field
pub fn leading_ones(bytes: &[u8]) -> u32 {
    let mut ones = 0;
    for byte in bytes {
        let run = byte.leading_ones();
        ones += run;
        if run < 8 {
            break;
        }
    }
    ones
}

/// Coarse/fine delay-line setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelayTap {
    pub idc: u32,
    pub idf: u32,
}

impl DelayTap {
    pub const fn new(idc: u32, idf: u32) -> Self {
        Self { idc, idf }
    }
}

impl fmt::Display for DelayTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idc={} idf={}", self.idc, self.idf)
    }
}

/// Field widths of the calibration register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationLayout {
    /// Coarse field width in bits
    pub idc_bits: u32,
    /// Fine field width in bits
    pub idf_bits: u32,
}

impl CalibrationLayout {
    pub const fn new(idc_bits: u32, idf_bits: u32) -> Self {
        Self { idc_bits, idf_bits }
    }

    /// Size of one packed word in bytes
    pub fn word_bytes(&self) -> usize {
        ((self.idc_bits + self.idf_bits) / 8) as usize
    }

    fn idf_bytes(&self) -> usize {
        (self.idf_bits / 8) as usize
    }

    /// Both fields must start on a byte boundary
    pub fn validate(&self) -> Result<()> {
        if self.idc_bits == 0 || self.idc_bits % 8 != 0 || self.idf_bits % 8 != 0 {
            return Err(Error::Config(format!(
                "calibration fields must be non-empty multiples of 8 bits (idc={}, idf={})",
                self.idc_bits, self.idf_bits
            )));
        }
        Ok(())
    }
}

impl Default for CalibrationLayout {
    fn default() -> Self {
        Self::new(32, 96)
    }
}

/// Packed calibration register contents: IDF field then IDC field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationWord {
    bytes: Vec<u8>,
    layout: CalibrationLayout,
}

impl CalibrationWord {
    /// Wrap raw register bytes, e.g. read back from a calibration file
    pub fn from_bytes(bytes: Vec<u8>, layout: CalibrationLayout) -> Result<Self> {
        if bytes.len() != layout.word_bytes() {
            return Err(Error::Config(format!(
                "calibration word has {} bytes, layout expects {}",
                bytes.len(),
                layout.word_bytes()
            )));
        }
        Ok(Self { bytes, layout })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn layout(&self) -> CalibrationLayout {
        self.layout
    }

    /// Re-extract the tap by counting leading ones of each field
    pub fn tap(&self) -> DelayTap {
        let (idf, idc) = self.bytes.split_at(self.layout.idf_bytes());
        DelayTap::new(leading_ones(idc), leading_ones(idf))
    }

    /// 32-bit big-endian words, lowest byte offset first
    ///
    /// Trailing bytes that do not fill a word are zero padded.
    pub fn to_words(&self) -> Vec<u32> {
        self.bytes
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_be_bytes(word)
            })
            .collect()
    }
}

impl fmt::Display for CalibrationWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.bytes))
    }
}

/// Pack a tap into the calibration register layout
pub fn pack_calibration_word(tap: DelayTap, layout: CalibrationLayout) -> Result<CalibrationWord> {
    layout.validate()?;
    let idf = encode_thermometer(tap.idf, layout.idf_bits)?;
    let idc = encode_thermometer(tap.idc, layout.idc_bits)?;

    let mut bytes = idf.into_bytes();
    bytes.extend_from_slice(idc.as_bytes());

    Ok(CalibrationWord { bytes, layout })
}
