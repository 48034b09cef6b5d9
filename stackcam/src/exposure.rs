//! Timed exposures over a free-running frame stream.
//!
//! An exposure resets the [FrameAccumulator], waits until the exposure time
//! has elapsed and at least one frame was stacked, then takes the stack. If
//! not a single frame arrives within the exposure timeout the exposure fails.
//!
//! ```text
//!  Idle --begin--> Exposing --elapsed, >=1 frame--> Ready --take--> Idle
//!                     |
//!                     +--no frame before timeout--> TimedOut --take--> Idle
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stackcam_types::{ExposureLimits, Verb};

use crate::accumulator::{ExposureStart, FrameAccumulator, StackedImage};
use crate::config::ExposureConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    Idle,
    Exposing,
    Ready,
    TimedOut,
}

/// A finished exposure.
#[derive(Debug, Clone)]
pub struct ExposureResult {
    pub image: StackedImage,
    /// Requested exposure time (seconds).
    pub etime: f64,
    pub start: ExposureStart,
    /// Time from the start until the stack was taken.
    pub elapsed: Duration,
}

struct Pending {
    etime: f64,
    start: ExposureStart,
    outcome: Option<Result<ExposureResult>>,
}

pub struct ExposureController {
    accumulator: Arc<FrameAccumulator>,
    limits: ExposureLimits,
    expose_timeout: Duration,
    output_scale: f64,
    state_tx: watch::Sender<ExposureState>,
    pending: Option<Pending>,
}

impl ExposureController {
    pub fn new(accumulator: Arc<FrameAccumulator>, cfg: &ExposureConfig) -> Self {
        let (state_tx, _) = watch::channel(ExposureState::Idle);
        Self {
            accumulator,
            limits: cfg.limits(),
            expose_timeout: Duration::from_secs_f64(cfg.expose_timeout_secs),
            output_scale: cfg.output_scale,
            state_tx,
            pending: None,
        }
    }

    pub fn state(&self) -> ExposureState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ExposureState> {
        self.state_tx.subscribe()
    }

    pub fn limits(&self) -> ExposureLimits {
        self.limits
    }

    pub fn accumulator(&self) -> &Arc<FrameAccumulator> {
        &self.accumulator
    }

    fn set_state(&self, state: ExposureState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!("exposure state {prev:?} -> {state:?}");
        }
    }

    /// Start an exposure of `etime` seconds.
    ///
    /// Nothing changes if `etime` is out of range or an exposure is already
    /// running.
    pub fn begin(&mut self, etime: f64) -> Result<ExposureStart> {
        if self.state() == ExposureState::Exposing {
            return Err(Error::Busy);
        }
        if !self.limits.contains(etime) {
            return Err(Error::validation(Verb::Image, "Invalid exposure time specified"));
        }
        if let Some(stale) = self.pending.take() {
            warn!(
                "discarding unclaimed outcome of the exposure started at {}",
                stale.start.datetime
            );
        }
        let start = self.accumulator.begin_exposure();
        self.pending = Some(Pending {
            etime,
            start,
            outcome: None,
        });
        self.set_state(ExposureState::Exposing);
        info!("exposure of {etime:.3} s started");
        Ok(start)
    }

    /// Wait until the running exposure is [ExposureState::Ready] or
    /// [ExposureState::TimedOut]. Returns immediately in any other state.
    ///
    /// Wakes on every delivered frame and at the exposure deadlines; never
    /// polls.
    pub async fn wait(&mut self) -> ExposureState {
        let (etime, start) = match &self.pending {
            Some(p) if p.outcome.is_none() => (p.etime, p.start),
            _ => return self.state(),
        };
        let stop_at = start.instant + Duration::from_secs_f64(etime);
        let timeout_at = start.instant + self.expose_timeout;

        let accumulator = self.accumulator.clone();
        loop {
            // A frame arriving before the select leaves a permit behind.
            let arrived = accumulator.frame_arrived();
            let now = Instant::now();
            let frame_count = accumulator.frame_count();

            if frame_count > 0 && now >= stop_at {
                return self.complete(etime, start);
            }
            if frame_count == 0 && now > timeout_at {
                return self.fail(start);
            }

            let wake_at = if frame_count > 0 {
                stop_at
            } else if now < stop_at {
                stop_at.min(timeout_at)
            } else {
                timeout_at
            };
            tokio::select! {
                _ = arrived => {}
                _ = tokio::time::sleep_until(wake_at.into()) => {}
            }
        }
    }

    fn complete(&mut self, etime: f64, start: ExposureStart) -> ExposureState {
        let outcome = match self.accumulator.finish_exposure(self.output_scale) {
            Some(image) => {
                let elapsed = start.instant.elapsed();
                info!(
                    "exposure complete: {} frames in {:.3} s",
                    image.frame_count,
                    elapsed.as_secs_f64()
                );
                Ok(ExposureResult {
                    image,
                    etime,
                    start,
                    elapsed,
                })
            }
            None => Err(Error::Timeout {
                waited: start.instant.elapsed(),
            }),
        };
        let state = if outcome.is_ok() {
            ExposureState::Ready
        } else {
            ExposureState::TimedOut
        };
        if let Some(p) = self.pending.as_mut() {
            p.outcome = Some(outcome);
        }
        self.set_state(state);
        state
    }

    fn fail(&mut self, start: ExposureStart) -> ExposureState {
        self.accumulator.abort_exposure();
        let waited = start.instant.elapsed();
        error!(
            "exposure timeout: no frame within {:.3} s",
            waited.as_secs_f64()
        );
        if let Some(p) = self.pending.as_mut() {
            p.outcome = Some(Err(Error::Timeout { waited }));
        }
        self.set_state(ExposureState::TimedOut);
        ExposureState::TimedOut
    }

    /// Claim the outcome of a finished exposure, returning to
    /// [ExposureState::Idle]. `None` while exposing or idle.
    pub fn take_outcome(&mut self) -> Option<Result<ExposureResult>> {
        if self.pending.as_ref()?.outcome.is_none() {
            return None;
        }
        let outcome = self.pending.take()?.outcome;
        self.set_state(ExposureState::Idle);
        outcome
    }

    /// Run one complete exposure of `etime` seconds.
    pub async fn capture(&mut self, etime: f64) -> Result<ExposureResult> {
        self.begin(etime)?;
        self.wait().await;
        self.take_outcome().unwrap_or_else(|| {
            Err(Error::Timeout {
                waited: Duration::ZERO,
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use stackcam_sensor::sim::{SimulatedSensor, SimulatedSensorConfig};
    use stackcam_sensor::{RawFrame, SensorDriver};
    use test_log::test;

    fn exposure_cfg(expose_timeout_secs: f64) -> ExposureConfig {
        ExposureConfig {
            expose_timeout_secs,
            ..Default::default()
        }
    }

    fn sim_sensor(frame_rate_hz: f64) -> SimulatedSensor {
        SimulatedSensor::new(
            "exposure-test",
            SimulatedSensorConfig {
                width: 64,
                height: 48,
                frame_rate_hz,
                ..Default::default()
            },
        )
    }

    #[test(tokio::test)]
    async fn ten_hertz_for_one_second() {
        let acc = Arc::new(FrameAccumulator::new());
        let mut sensor = sim_sensor(10.0);
        sensor.acquisition_start(acc.clone()).unwrap();
        let mut ctrl = ExposureController::new(acc, &exposure_cfg(5.0));

        let result = ctrl.capture(1.0).await.unwrap();
        sensor.acquisition_stop().unwrap();

        assert!(
            (9..=11).contains(&result.image.frame_count),
            "{} frames",
            result.image.frame_count
        );
        let elapsed = result.elapsed.as_secs_f64();
        assert!((1.0..1.25).contains(&elapsed), "elapsed {elapsed}");
        assert_eq!(result.image.pixels.len(), 64 * 48);
        assert_eq!(ctrl.state(), ExposureState::Idle);
    }

    #[test(tokio::test)]
    async fn no_frames_times_out() {
        let acc = Arc::new(FrameAccumulator::new());
        let mut ctrl = ExposureController::new(acc.clone(), &exposure_cfg(0.3));
        let t0 = Instant::now();
        let result = ctrl.capture(0.1).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(t0.elapsed() >= Duration::from_millis(300));
        assert!(t0.elapsed() < Duration::from_secs(2));
        assert_eq!(ctrl.state(), ExposureState::Idle);
        assert!(!acc.is_exposing());
    }

    #[test(tokio::test)]
    async fn late_first_frame_waits_past_stop_time() {
        let acc = Arc::new(FrameAccumulator::new());
        let mut ctrl = ExposureController::new(acc.clone(), &exposure_cfg(5.0));
        let sender = acc.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(400));
            let frame = RawFrame::now(2, 2, vec![1, 2, 3, 4], 0).unwrap();
            sender.add_frame(&frame);
        });
        let result = ctrl.capture(0.1).await.unwrap();
        assert_eq!(result.image.frame_count, 1);
        assert!(result.elapsed >= Duration::from_millis(400));
    }

    #[test(tokio::test)]
    async fn states_through_an_exposure() {
        let acc = Arc::new(FrameAccumulator::new());
        let mut ctrl = ExposureController::new(acc.clone(), &exposure_cfg(5.0));
        let rx = ctrl.subscribe();
        assert_eq!(*rx.borrow(), ExposureState::Idle);
        assert!(ctrl.take_outcome().is_none());

        ctrl.begin(0.1).unwrap();
        assert_eq!(*rx.borrow(), ExposureState::Exposing);
        assert!(matches!(ctrl.begin(0.1), Err(Error::Busy)));
        assert!(ctrl.take_outcome().is_none());

        acc.add_frame(&RawFrame::now(1, 1, vec![9], 0).unwrap());
        assert_eq!(ctrl.wait().await, ExposureState::Ready);
        assert_eq!(*rx.borrow(), ExposureState::Ready);

        let result = ctrl.take_outcome().unwrap().unwrap();
        assert_eq!(result.image.frame_count, 1);
        assert_eq!(*rx.borrow(), ExposureState::Idle);
    }

    #[test(tokio::test)]
    async fn out_of_range_changes_nothing() {
        let acc = Arc::new(FrameAccumulator::new());
        let mut ctrl = ExposureController::new(acc.clone(), &exposure_cfg(5.0));
        for etime in [0.0, 0.05, 601.0, f64::NAN] {
            assert!(matches!(
                ctrl.capture(etime).await,
                Err(Error::Validation { .. })
            ));
        }
        assert_eq!(ctrl.state(), ExposureState::Idle);
        assert!(!acc.is_exposing());
    }
}
