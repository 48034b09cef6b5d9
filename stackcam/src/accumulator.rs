//! Stacking of background-subtracted frames.
//!
//! [FrameAccumulator] is the [FrameSink] registered with the sensor driver.
//! For every delivered frame it estimates the background as the median
//! sample value and adds `frame - median` into a signed sum buffer. Outside
//! an exposure the buffer is cleared before each frame, so an exposure
//! always starts from the frames that arrive after [FrameAccumulator::begin_exposure].
//!
//! The frame callback runs on the driver's capture thread while exposures
//! are started and finished from the async device task. All shared state
//! lives behind one short-lived lock; the median is computed outside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, warn};

use stackcam_sensor::{FrameSink, RawFrame};

/// When and where an exposure began.
#[derive(Debug, Clone, Copy)]
pub struct ExposureStart {
    pub instant: Instant,
    pub datetime: chrono::DateTime<chrono::Utc>,
}

/// The result of stacking the frames of one exposure.
#[derive(Debug, Clone)]
pub struct StackedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
    /// Number of frames summed into `pixels`.
    pub frame_count: u32,
}

#[derive(Debug, Default)]
struct AccumulatorState {
    /// Set by the first frame. All later frames must match.
    dims: Option<(u32, u32)>,
    sum: Vec<i32>,
    frame_count: u32,
    exposure_start: Option<ExposureStart>,
}

impl AccumulatorState {
    fn clear(&mut self) {
        self.sum.iter_mut().for_each(|v| *v = 0);
        self.frame_count = 0;
    }

    fn stacked(&self, scale: f64) -> Option<StackedImage> {
        let (width, height) = self.dims?;
        let offset = imops::min_value(&self.sum).unwrap_or(0);
        Some(StackedImage {
            width,
            height,
            pixels: imops::scale_offset_to_u16(&self.sum, offset, scale),
            frame_count: self.frame_count,
        })
    }
}

pub struct FrameAccumulator {
    state: Mutex<AccumulatorState>,
    /// Reused for the median. Only the capture thread takes this lock.
    scratch: Mutex<Vec<u16>>,
    frame_arrived: Notify,
    dropped_frames: AtomicU64,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AccumulatorState::default()),
            scratch: Mutex::new(Vec::new()),
            frame_arrived: Notify::new(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Add one frame. Called from the driver's capture thread.
    pub fn add_frame(&self, frame: &RawFrame) {
        let data = frame.data();
        if data.is_empty() {
            return;
        }

        let background = {
            let mut scratch = self.scratch.lock();
            scratch.clear();
            scratch.extend_from_slice(data);
            imops::median_in_place(&mut scratch).unwrap_or(0)
        };

        {
            let mut state = self.state.lock();
            let dims = (frame.width(), frame.height());
            let current = state.dims;
            match current {
                None => {
                    state.dims = Some(dims);
                    state.sum = vec![0; data.len()];
                    debug!("stacking buffer allocated for {}x{}", dims.0, dims.1);
                }
                Some(expected) if expected != dims => {
                    drop(state);
                    let n = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "dropping {}x{} frame {}: stacking {}x{} ({n} dropped)",
                        dims.0,
                        dims.1,
                        frame.host_timing().fno,
                        expected.0,
                        expected.1
                    );
                    return;
                }
                Some(_) => {}
            }

            if state.exposure_start.is_none() {
                // Free running: the buffer holds only the latest frame.
                state.clear();
                imops::accumulate_background_subtracted(&mut state.sum, data, background);
            } else {
                imops::accumulate_background_subtracted(&mut state.sum, data, background);
                state.frame_count += 1;
            }
        }

        self.frame_arrived.notify_one();
    }

    /// Zero the sum buffer and the frame count.
    pub fn reset(&self) {
        self.state.lock().clear();
    }

    /// Zero the buffer and start counting frames, as one step.
    pub fn begin_exposure(&self) -> ExposureStart {
        let start = ExposureStart {
            instant: Instant::now(),
            datetime: chrono::Utc::now(),
        };
        let mut state = self.state.lock();
        state.clear();
        state.exposure_start = Some(start);
        start
    }

    /// Stop counting frames and return the stack.
    ///
    /// Returns `None` if no frame was ever delivered.
    pub fn finish_exposure(&self, scale: f64) -> Option<StackedImage> {
        let mut state = self.state.lock();
        let image = state.stacked(scale);
        state.exposure_start = None;
        image
    }

    /// Stop counting frames, discarding the stack.
    pub fn abort_exposure(&self) {
        self.state.lock().exposure_start = None;
    }

    /// The current stack, without ending the exposure.
    ///
    /// The sum is shifted so its minimum becomes zero, multiplied by `scale`
    /// and clamped to 16 bits.
    pub fn compute_result(&self, scale: f64) -> Option<StackedImage> {
        self.state.lock().stacked(scale)
    }

    /// Discard what has been stacked so far, e.g. after a settings change.
    ///
    /// An exposure in progress keeps running from an empty buffer.
    pub fn invalidate(&self) {
        self.reset();
    }

    pub fn frame_count(&self) -> u32 {
        self.state.lock().frame_count
    }

    pub fn exposure_start(&self) -> Option<ExposureStart> {
        self.state.lock().exposure_start
    }

    pub fn is_exposing(&self) -> bool {
        self.exposure_start().is_some()
    }

    /// Dimensions fixed by the first delivered frame.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.state.lock().dims
    }

    /// Number of frames rejected for not matching [Self::dimensions].
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// A copy of the raw sum buffer.
    pub fn sum_snapshot(&self) -> Vec<i32> {
        self.state.lock().sum.clone()
    }

    /// Completes once a frame is added. A frame added while nobody waits
    /// completes the next call immediately.
    pub fn frame_arrived(&self) -> Notified<'_> {
        self.frame_arrived.notified()
    }
}

impl FrameSink for FrameAccumulator {
    fn on_frame(&self, frame: &RawFrame) {
        self.add_frame(frame);
    }
}
