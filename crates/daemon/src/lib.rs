//! CyberLab daemon
//!
//! Lifecycle control for container-based training labs: the compose
//! launcher, the runtime client, the per-lab controller, the health sweep
//! and the HTTP surface over them.

pub mod api;
pub mod compose;
pub mod config;
pub mod controller;
pub mod runtime;
pub mod sweep;

#[cfg(test)]
mod testing;
