//! A network exposure server for imaging sensors.
//!
//! The sensor delivers frames continuously. On an `IMAGE` request the server
//! stacks the median-subtracted frames arriving during the exposure time and
//! returns the stack as a FITS image over the same TCP connection.
//!
//! The moving parts, from the sensor outwards:
//!
//! - [accumulator::FrameAccumulator] receives frames from the driver thread.
//! - [exposure::ExposureController] runs timed exposures on it.
//! - [device::Device] owns the driver, the settings and the status store.
//! - [dispatcher::CommandDispatcher] turns command lines into replies.
//! - [server::StackcamServer] accepts clients and serializes their commands.

pub mod accumulator;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatcher;
mod error;
pub mod exposure;
pub mod fits;
pub mod netinfo;
pub mod server;
pub mod session;
pub mod status_store;

pub use error::{Error, Result};

pub use config::{StackcamConfig, parse_config_file};
pub use device::Device;
pub use dispatcher::CommandDispatcher;
pub use server::StackcamServer;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "stackcam=info,stackcam_sensor=info,warn";
