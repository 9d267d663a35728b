//! Task governor daemon
//!
//! Wires the capacity and container health monitors into a long-running
//! process with HTTP probes.

pub mod api;
pub mod config;
pub mod pumps;
