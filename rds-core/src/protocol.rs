// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! Byte-stream command protocol (UART and USB boards)
//!
//! Every transaction starts with a one-byte address that the board echoes back.
//! Multi-byte payloads travel last byte first: the host sends from the end of
//! its buffer backwards and fills its receive buffer from the end backwards.
//! Both directions must keep that order or the board will see byte-reversed
//! keys and plaintexts.
//!
//! ```text
//!   host                     board
//!    | -- addr ------------->  |
//!    | <------------- addr --  |   ack must match
//!    | -- buf[n-1..=0] ----->  |   payload, reversed
//!    | <------ 0x42 ---------  |   after plaintext only
//! ```

use crate::error::LinkError;
use crate::link::{Link, LinkResult};
use serde::{Deserialize, Serialize};

/// Logical register addresses of a byte-stream board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpace {
    pub key: u8,
    pub mask: u8,
    pub plaintext: u8,
    pub cipher: u8,
    pub trace: u8,
    pub calibration: u8,
    /// Soft reset of the controller FSM, not acknowledged
    pub reset_loop: u8,
    /// Control command prefix, followed by one data byte, not acknowledged
    pub control: u8,
    /// Clock selection prefix, followed by one data byte, not acknowledged
    pub frequency: u8,
    /// Byte sent by the board once an encryption has finished
    pub done_sentinel: u8,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self {
            key: 0x01,
            mask: 0x02,
            plaintext: 0x03,
            cipher: 0x04,
            trace: 0x05,
            calibration: 0x06,
            reset_loop: 0xFF,
            control: 0xE0,
            frequency: 0xEF,
            done_sentinel: 0x42,
        }
    }
}

/// Data bytes accepted after [`AddressSpace::control`]
pub mod control {
    /// Reset the AES core
    pub const RESET_AES: u8 = 0x02;
    /// Calibrate the sensor and reset the AES core
    pub const CALIBRATE: u8 = 0xFF;
}

/// Layout of one sample in a trace frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLayout {
    /// Sensor register bytes per sample on the wire
    pub sensor_bytes: usize,
    /// Auxiliary signal bytes per sample on the wire
    pub aux_bytes: usize,
}

impl FrameLayout {
    pub fn stride(&self) -> usize {
        self.sensor_bytes + self.aux_bytes
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            sensor_bytes: 16,
            aux_bytes: 2,
        }
    }
}

/// Send `buf` last byte first
pub fn write_reversed<L: Link + ?Sized>(link: &mut L, buf: &[u8]) -> LinkResult<()> {
    let reversed: Vec<u8> = buf.iter().rev().copied().collect();
    link.write(&reversed)
}

/// Receive `buf.len()` bytes, storing the first one at the end of `buf`
pub fn read_reversed<L: Link + ?Sized>(link: &mut L, buf: &mut [u8]) -> LinkResult<()> {
    link.read(buf)?;
    buf.reverse();
    Ok(())
}

/// Send an address byte and check the echo
pub fn write_address<L: Link + ?Sized>(link: &mut L, address: u8) -> LinkResult<()> {
    link.write(&[address])?;
    let mut ack = [0u8; 1];
    link.read(&mut ack)?;
    if ack[0] != address {
        return Err(LinkError::AckMismatch {
            expected: address,
            actual: ack[0],
        });
    }
    Ok(())
}

/// Address a register and write a payload to it
pub fn write_payload<L: Link + ?Sized>(link: &mut L, address: u8, payload: &[u8]) -> LinkResult<()> {
    write_address(link, address)?;
    write_reversed(link, payload)
}

/// Address a register and read a payload from it
pub fn read_payload<L: Link + ?Sized>(link: &mut L, address: u8, payload: &mut [u8]) -> LinkResult<()> {
    write_address(link, address)?;
    read_reversed(link, payload)
}

/// Two-byte command without acknowledgement
pub fn write_command<L: Link + ?Sized>(link: &mut L, prefix: u8, data: u8) -> LinkResult<()> {
    link.write(&[prefix])?;
    link.write(&[data])
}

/// Wait for the completion byte
pub fn expect_sentinel<L: Link + ?Sized>(link: &mut L, sentinel: u8) -> LinkResult<()> {
    let mut flag = [0u8; 1];
    link.read(&mut flag)?;
    if flag[0] != sentinel {
        return Err(LinkError::UnexpectedSentinel {
            expected: sentinel,
            actual: flag[0],
        });
    }
    Ok(())
}

/// Split a host-order trace buffer into sensor bytes and auxiliary words
///
/// `buf` is the buffer as filled by [`read_reversed`], so the first byte on the
/// wire sits at `buf[len - 1]`. Within each frame the sensor bytes come first
/// on the wire, followed by the auxiliary word low byte last.
pub fn split_frames(buf: &[u8], layout: FrameLayout) -> (Vec<u8>, Vec<u16>) {
    let stride = layout.stride();
    let samples = if stride == 0 { 0 } else { buf.len() / stride };
    let last = buf.len().saturating_sub(1);

    let mut sensor = Vec::with_capacity(samples * layout.sensor_bytes);
    let mut aux = Vec::with_capacity(if layout.aux_bytes > 0 { samples } else { 0 });

    for i in 0..samples {
        let base = last - stride * i;
        for k in 0..layout.sensor_bytes {
            sensor.push(buf[base - k]);
        }
        if layout.aux_bytes > 0 {
            // aux bytes arrive low byte first after the sensor bytes
            let mut word: u16 = 0;
            for k in (0..layout.aux_bytes.min(2)).rev() {
                word = (word << 8) | buf[base - layout.sensor_bytes - k] as u16;
            }
            aux.push(word);
        }
    }
    (sensor, aux)
}
