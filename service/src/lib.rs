//! Bootstrap and control plane of the Tunnelkeeper background service.
//!
//! The binary is a thin wrapper around [`bootstrap::run`].

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bootstrap;
pub mod cli;
pub mod daemon;
pub mod dir_guard;
pub mod installer;
pub mod instance_lock;
pub mod integrity;
pub mod ipc;
pub mod protocol;
pub mod service;
pub mod settings;
pub mod updater;

#[cfg(windows)]
mod windows;

#[cfg(test)]
mod fakes;
