//! Library space for the sounding-rocket flight computer firmware.
#![cfg_attr(not(any(test, feature = "sim")), no_std)]

pub mod cfg;
pub mod controller;
pub mod data;
pub mod detector;
pub mod flash;
pub mod logger;
pub mod mem;
pub mod sensors;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

/// Firmware version baked into the image at build time.
pub const FC_FIRMWARE_VERSION: &'static str = env!("CARGO_PKG_VERSION");
