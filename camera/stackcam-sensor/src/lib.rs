//! Sensor driver contract for the stackcam exposure server.
//!
//! A driver owns the hardware. Once acquisition is started it delivers
//! [RawFrame]s to a [FrameSink] from its own capture thread, at a cadence
//! set by the hardware and independent of any exposure in progress. The
//! server only ever asks the driver to change gain or to begin an exposure.
//!
//! The [sim] module provides a free-running simulated sensor used by the
//! `stackcam` binary when no vendor backend is compiled in, and by tests.

use std::sync::Arc;

pub use stackcam_types::GainMode;

pub mod sim;

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame buffer of {len} samples does not match {width}x{height}")]
    FrameSize { width: u32, height: u32, len: usize },
    #[error("acquisition already started")]
    AlreadyAcquiring,
    #[error("SensorError({msg})")]
    SensorError { msg: String },
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::SensorError {
            msg: orig.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::SensorError { msg }
    }
}

// ---------------------------
// RawFrame

/// Timing information acquired on the host computer.
#[derive(Debug, Clone)]
pub struct HostTimingInfo {
    /// The frame number as counted by the driver.
    pub fno: usize,
    /// The time the driver received the frame.
    pub datetime: chrono::DateTime<chrono::Utc>,
}

/// One frame of unsigned 16-bit samples, row major.
///
/// Immutable once constructed: the sample buffer length always equals
/// `width * height`.
#[derive(Debug, Clone)]
pub struct RawFrame {
    width: u32,
    height: u32,
    data: Vec<u16>,
    host_timing: HostTimingInfo,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Vec<u16>, host_timing: HostTimingInfo) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            return Err(Error::FrameSize {
                width,
                height,
                len: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
            host_timing,
        })
    }

    /// Build a frame stamped with the current time.
    pub fn now(width: u32, height: u32, data: Vec<u16>, fno: usize) -> Result<Self> {
        let host_timing = HostTimingInfo {
            fno,
            datetime: chrono::Utc::now(),
        };
        Self::new(width, height, data, host_timing)
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn data(&self) -> &[u16] {
        &self.data
    }
    pub fn host_timing(&self) -> &HostTimingInfo {
        &self.host_timing
    }
}

// ---------------------------
// FrameSink

/// Receives frames from a driver's capture thread.
///
/// Implementations must return quickly: the driver calls this at hardware
/// cadence and must not be stalled by the consumer.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &RawFrame);
}

// ---------------------------
// SensorDriver

pub trait SensorDriver: Send {
    /// A short name identifying the sensor instance.
    fn name(&self) -> &str;
    /// The camera model, recorded in image metadata.
    fn model(&self) -> &str;

    /// Sensor width in pixels.
    fn width(&self) -> u32;
    /// Sensor height in pixels.
    fn height(&self) -> u32;

    /// Begin delivering frames to `sink` from the driver's capture thread.
    fn acquisition_start(&mut self, sink: Arc<dyn FrameSink>) -> Result<()>;
    /// Stop delivering frames. Blocks until the capture thread has exited.
    fn acquisition_stop(&mut self) -> Result<()>;

    /// Prepare the sensor for an exposure of `etime` seconds at `gain`.
    ///
    /// Free-running sensors integrate whatever frames they deliver anyway,
    /// so the default implementation does nothing. Must not block for the
    /// duration of the exposure.
    fn start_exposure(&mut self, etime: f64, gain: GainMode) -> Result<()> {
        let _ = (etime, gain);
        Ok(())
    }

    // Settings: Gain ----------------------------
    fn gain_mode(&self) -> Result<GainMode>;
    fn set_gain_mode(&mut self, gain: GainMode) -> Result<()>;
}
