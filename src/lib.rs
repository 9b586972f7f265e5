//! Entanglement fidelity analysis for two-node heralded-entanglement runs.
//!
//! This crate provides:
//! - Heralding-event extraction from time-tagger detection and readout files
//! - Detection-window and coincidence-time filtering
//! - Parity-split correlation histograms in the ZZ, XX and X-X bases
//! - Readout-error correction and the fidelity witness with uncertainties
//! - A parameter sweep over (dt, window-1, window-2) with hashed JSON archives
//! - A seeded run simulator for demos, tests and benchmarks
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod correlate;
pub mod event;
pub mod extract;
pub mod fidelity;
pub mod filter;
pub mod readout;
pub mod sim;
pub mod store;
pub mod sweep;
pub mod util;
