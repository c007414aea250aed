// SPDX-License-Identifier: MIT
//
// RDS Capture: Delay-Line Sensor Calibration and Trace Acquisition
// Copyright (c) 2025 RDS Capture Contributors

//! RDS Core Library
//!
//! Host side of a delay-line power sensor rig. An FPGA runs an AES core next
//! to a tapped delay line whose register snapshots ("samples") follow the
//! supply voltage. This crate calibrates the delay line so the snapshots sit
//! in their useful range and then records one trace per encryption, together
//! with the key, plaintext and ciphertext that produced it.
//!
//! # Architecture
//!
//! - `thermometer`: thermometer codes and calibration words
//! - `decoder`: sample weights and trace extrema
//! - `link`: raw transport to the board
//! - `protocol` / `registers`: byte-stream and register-mapped wire formats
//! - `board`: board drivers built on a link
//! - `calibration`: the two-phase tap search and the other calibration modes
//! - `session`: resilient trace acquisition
//! - `sinks`: dump files
//! - `sim`: simulated byte-stream board
//! - `config`, `metrics`, `retry`, `error`: ambient support

pub mod board;
pub mod calibration;
pub mod config;
pub mod crypto;
pub mod decoder;
pub mod error;
pub mod link;
pub mod metrics;
pub mod protocol;
pub mod registers;
pub mod retry;
pub mod session;
pub mod sim;
pub mod sinks;
pub mod thermometer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
