//! Sensor trace decoding
//!
//! A trace is a flat buffer of fixed-width samples. Each sample is a snapshot
//! of the delay-line register; its Hamming weight is the scalar the rest of the
//! system works with.

use crate::{Error, Result};

/// One captured trace: `samples` rows of `sample_bytes` bytes each
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    data: Vec<u8>,
    sample_bytes: usize,
    /// Auxiliary per-sample signal words (e.g. on-die temperature), may be empty
    aux: Vec<u16>,
}

impl Trace {
    pub fn new(data: Vec<u8>, sample_bytes: usize) -> Self {
        Self {
            data,
            sample_bytes: sample_bytes.max(1),
            aux: Vec::new(),
        }
    }

    pub fn with_aux(mut self, aux: Vec<u16>) -> Self {
        self.aux = aux;
        self
    }

    pub fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.sample_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn aux(&self) -> &[u16] {
        &self.aux
    }

    /// Iterate over samples in capture order
    pub fn samples(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.sample_bytes)
    }

    /// Hamming weight of every sample
    pub fn weights(&self) -> Vec<u32> {
        self.samples().map(hamming_weight).collect()
    }
}

/// How sample windows are laid over the trace buffer when scanning weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleStride {
    /// Sample `j` starts at byte `j * sample_bytes`
    #[default]
    Exact,
    /// Sample `j` starts at byte `j`; reproduces an old calibration routine
    Overlapping,
}

/// Population count of one sample, independent of the transport word width
pub fn hamming_weight(sample: &[u8]) -> u32 {
    sample.iter().map(|b| b.count_ones()).sum()
}

/// Population count over 32-bit transport words
pub fn hamming_weight_words(words: &[u32]) -> u32 {
    words.iter().map(|w| w.count_ones()).sum()
}

/// Smallest sample weight of the trace
pub fn min_weight(trace: &Trace) -> Result<u32> {
    weight_extrema(trace, SampleStride::Exact).map(|(min, _)| min)
}

/// Largest sample weight of the trace
pub fn max_weight(trace: &Trace) -> Result<u32> {
    weight_extrema(trace, SampleStride::Exact).map(|(_, max)| max)
}

/// Minimum and maximum sample weight in one pass
pub fn weight_extrema(trace: &Trace, stride: SampleStride) -> Result<(u32, u32)> {
    let count = trace.len();
    if count == 0 {
        return Err(Error::EmptyTrace);
    }

    let width = trace.sample_bytes;
    let step = match stride {
        SampleStride::Exact => width,
        SampleStride::Overlapping => 1,
    };

    let (mut min, mut max) = (u32::MAX, 0);
    for j in 0..count {
        let start = j * step;
        let weight = hamming_weight(&trace.data[start..start + width]);
        min = min.min(weight);
        max = max.max(weight);
    }
    Ok((min, max))
}

/// Convert a raw auxiliary word from the on-die ADC to degrees Celsius
pub fn xadc_celsius(raw: u16) -> f64 {
    (raw as f64 * 503.975) / 4096.0 - 273.15
}
