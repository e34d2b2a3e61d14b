// Copyright 2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! ospi-nor
//!
//! Block-device driver for quad/octal-SPI NOR flash, with interrupt-driven
//! bulk transfers and a simulated MX25R6435F for host-side use.

pub mod geometry;
pub mod config;
pub mod command;
pub mod sync;
pub mod link;
pub mod transport;
pub mod status;
pub mod program;
pub mod flash;
pub mod sim;

pub use flash::{Error, Result, NorFlash, Info, ConfigStep, InitStep};
pub use config::Config;
pub use geometry::{Geometry, MX25R6435F};
pub use link::Link;
pub use status::ChipStatus;
