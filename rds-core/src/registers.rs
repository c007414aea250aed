//! Register map of the memory-mapped (PCIe) sensor kernel

use serde::{Deserialize, Serialize};

/// Byte offsets and status patterns of the acquisition kernel
///
/// 128-bit values (key, plaintext, ciphertext) occupy four consecutive 32-bit
/// registers with the most significant word at the highest offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMap {
    pub status: u32,
    pub ciphertext: u32,
    pub reset: u32,
    /// Two registers: low half, then high half of the DMA address
    pub dump_pointer: u32,
    pub key_base: u32,
    pub plaintext_base: u32,
    pub calibration_base: u32,
    /// Written with the sensor index to latch the calibration registers
    pub calibration_commit: u32,
    pub calibration_trigger: u32,
    pub start: u32,
    pub set_key: u32,
    pub calibration_trigger_value: u32,
    /// Status bits that must all be set once a calibration dump is complete
    pub calibration_idle_mask: u32,
    /// Status bits inspected after an encryption
    pub trace_idle_mask: u32,
    /// Expected value of `status & trace_idle_mask` after an encryption
    pub trace_done_pattern: u32,
    /// 32-bit words per sample row in the DMA buffer
    pub row_words: usize,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            status: 0x000,
            ciphertext: 0x004,
            reset: 0x100,
            dump_pointer: 0x200,
            key_base: 0x300,
            plaintext_base: 0x400,
            calibration_base: 0x500,
            calibration_commit: 0x600,
            calibration_trigger: 0x700,
            start: 0x800,
            set_key: 0x900,
            calibration_trigger_value: 0x5000_0000,
            calibration_idle_mask: 0x03,
            trace_idle_mask: 0x23,
            trace_done_pattern: 0x03,
            row_words: 16,
        }
    }
}

impl RegisterMap {
    /// Offsets of the four block registers, paired with the word index
    /// (big-endian, word 0 is most significant) they hold
    pub fn block_slots(base: u32) -> impl Iterator<Item = (usize, u32)> {
        (0..4usize).map(move |chunk| (chunk, base + 4 * (3 - chunk as u32)))
    }
}

/// Split a 16-byte block into big-endian words
pub fn block_to_words(block: &[u8; 16]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (word, chunk) in words.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

/// Inverse of [`block_to_words`]
pub fn words_to_block(words: &[u32; 4]) -> [u8; 16] {
    let mut block = [0u8; 16];
    for (chunk, word) in block.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    block
}
