//! Synchronized rotating-stage image acquisition.
//!
//! A motion controller steps a rotating stage and, at every position, asks the host
//! over a serial line to capture an image. This crate runs that handshake, drives the
//! imaging sensor (and optionally a spectrometer), measures the latency of every step
//! and writes a per-run timing report next to the images.
//!
//! The pieces, bottom-up:
//!
//! - [`protocol`]: the controller's line protocol (`ready`, `capturar|<angle>`, `ok`)
//! - [`adapters`]: the controller link over serial or an in-memory pipe
//! - [`hardware`]: sensor and spectrometer sessions, with simulated devices
//! - [`frame`], [`timing`], [`report`]: captured data and what is derived from it
//! - [`sink`], [`layout`], [`metadata`]: everything a run writes to disk
//! - [`acquisition`]: the step state machine tying it together
//! - [`config`], [`error`], [`error_recovery`], [`logging`]: the ambient pieces

pub mod acquisition;
pub mod adapters;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod frame;
pub mod hardware;
pub mod layout;
pub mod logging;
pub mod metadata;
pub mod protocol;
pub mod report;
pub mod sink;
pub mod timing;
