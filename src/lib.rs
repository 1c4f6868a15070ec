//! Core library for the pump-probe STM sequencer.
//!
//! The crate drives three instruments (an arbitrary waveform generator, a
//! lock-in amplifier and an STM controller) through a timing-sensitive
//! measurement protocol. [`experiment::QueueSequencer`] consumes a queue of
//! sweep procedures and hands each experiment to
//! [`experiment::ExperimentRunner`], which prepares the AWG, safes the STM
//! bias, acquires lock-in readings and restores the STM on every path.

pub mod adapters;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod instrument;
pub mod metadata;
pub mod outcome;
pub mod session;
#[cfg(feature = "storage_csv")]
pub mod storage;
pub mod waveform;
