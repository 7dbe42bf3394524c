//! dockgrid library
//!
//! Provisions single-use browser-node containers for a test grid and reclaims
//! sessions whose node went idle.

pub mod config;
pub mod container;
pub mod grid;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod reclaimer;
pub mod runtime;
