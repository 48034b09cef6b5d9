//! A free-running simulated sensor.
//!
//! [SimulatedSensor] spawns a capture thread which renders frames at a fixed
//! rate and hands each one to the registered [FrameSink], the same way a
//! vendor driver calls back from its own USB thread. Frames consist of a
//! slowly drifting background level, uniform noise and a bright square
//! source in the middle of the field whose amplitude follows the gain mode.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::{Error, FrameSink, GainMode, RawFrame, Result, SensorDriver};

/// Parameters of the simulated sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSensorConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second. Zero or negative means no frames are ever delivered.
    pub frame_rate_hz: f64,
    pub background_level: u16,
    pub noise_amplitude: u16,
    pub model: String,
}

impl Default for SimulatedSensorConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 512,
            frame_rate_hz: 9.0,
            background_level: 8000,
            noise_amplitude: 40,
            model: "stackcam simulated sensor".into(),
        }
    }
}

pub struct SimulatedSensor {
    name: String,
    cfg: SimulatedSensorConfig,
    gain: Arc<Mutex<GainMode>>,
    /// When acquiring, has value of Some, else None.
    control_and_join_handle: Option<(thread_control::Control, std::thread::JoinHandle<()>)>,
}

fn _test_sensor_is_send() {
    // Compile-time test to ensure SimulatedSensor implements Send trait.
    fn implements<T: Send>() {}
    implements::<SimulatedSensor>();
}

impl SimulatedSensor {
    pub fn new(name: &str, cfg: SimulatedSensorConfig) -> Self {
        Self {
            name: name.to_string(),
            cfg,
            gain: Arc::new(Mutex::new(GainMode::default())),
            control_and_join_handle: None,
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.control_and_join_handle.is_some()
    }
}

fn source_amplitude(gain: GainMode) -> u32 {
    match gain {
        GainMode::Low => 250,
        GainMode::Auto | GainMode::Manual => 500,
        GainMode::High => 1000,
    }
}

fn render_frame<R: Rng>(
    cfg: &SimulatedSensorConfig,
    gain: GainMode,
    fno: usize,
    rng: &mut R,
) -> Vec<u16> {
    let (w, h) = (cfg.width as usize, cfg.height as usize);
    let drift = (fno % 64) as u32;
    let base = cfg.background_level as u32 + drift;
    let half = (w.min(h) / 32).max(1);
    let (cx, cy) = (w / 2, h / 2);
    let amplitude = source_amplitude(gain);

    let mut data = Vec::with_capacity(w * h);
    for row in 0..h {
        for col in 0..w {
            let mut value = base;
            if cfg.noise_amplitude > 0 {
                value += rng.random_range(0..=cfg.noise_amplitude as u32);
            }
            if row.abs_diff(cy) < half && col.abs_diff(cx) < half {
                value += amplitude;
            }
            data.push(value.min(u16::MAX as u32) as u16);
        }
    }
    data
}

impl SensorDriver for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }
    fn model(&self) -> &str {
        &self.cfg.model
    }
    fn width(&self) -> u32 {
        self.cfg.width
    }
    fn height(&self) -> u32 {
        self.cfg.height
    }

    fn acquisition_start(&mut self, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.control_and_join_handle.is_some() {
            return Err(Error::AlreadyAcquiring);
        }

        let (flag, control) = thread_control::make_pair();
        let cfg = self.cfg.clone();
        let gain = self.gain.clone();

        info!(
            "starting simulated sensor {}: {}x{} at {} Hz",
            self.name, cfg.width, cfg.height, cfg.frame_rate_hz
        );

        let thread_builder = std::thread::Builder::new().name(format!("sim-sensor-{}", self.name));
        let join_handle = thread_builder.spawn(move || {
            let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
            let period = if cfg.frame_rate_hz > 0.0 {
                Some(Duration::from_secs_f64(1.0 / cfg.frame_rate_hz))
            } else {
                None
            };
            let mut fno = 0;
            let mut next_frame_at = Instant::now();
            while flag.is_alive() {
                let Some(period) = period else {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                };
                let now = Instant::now();
                if now < next_frame_at {
                    // Sleep in short steps so that a stop request is noticed.
                    std::thread::sleep((next_frame_at - now).min(Duration::from_millis(10)));
                    continue;
                }
                let current_gain = *gain.lock();
                let data = render_frame(&cfg, current_gain, fno, &mut rng);
                match RawFrame::now(cfg.width, cfg.height, data, fno) {
                    Ok(frame) => sink.on_frame(&frame),
                    Err(e) => tracing::error!("rendering simulated frame failed: {e}"),
                }
                fno += 1;
                next_frame_at += period;
            }
            debug!(
                "closing thread {:?} ({:?}) after {fno} frames",
                std::thread::current().name(),
                std::thread::current().id(),
            );
        })?;

        self.control_and_join_handle = Some((control, join_handle));
        Ok(())
    }

    fn acquisition_stop(&mut self) -> Result<()> {
        if let Some((control, join_handle)) = self.control_and_join_handle.take() {
            control.stop();
            join_handle
                .join()
                .map_err(|_| Error::from("simulated capture thread panicked"))?;
        }
        Ok(())
    }

    fn start_exposure(&mut self, etime: f64, gain: GainMode) -> Result<()> {
        debug!("simulated exposure of {etime} s at gain {gain}");
        *self.gain.lock() = gain;
        Ok(())
    }

    fn gain_mode(&self) -> Result<GainMode> {
        Ok(*self.gain.lock())
    }

    fn set_gain_mode(&mut self, gain: GainMode) -> Result<()> {
        *self.gain.lock() = gain;
        Ok(())
    }
}

impl Drop for SimulatedSensor {
    fn drop(&mut self) {
        if let Err(e) = self.acquisition_stop() {
            tracing::error!("stopping simulated sensor: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use test_log::test;

    struct Counter {
        frames: AtomicUsize,
        last_len: AtomicUsize,
    }

    impl FrameSink for Counter {
        fn on_frame(&self, frame: &RawFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(frame.data().len(), Ordering::SeqCst);
        }
    }

    fn small_cfg(frame_rate_hz: f64) -> SimulatedSensorConfig {
        SimulatedSensorConfig {
            width: 32,
            height: 16,
            frame_rate_hz,
            ..Default::default()
        }
    }

    #[test]
    fn delivers_frames_until_stopped() {
        let counter = Arc::new(Counter {
            frames: AtomicUsize::new(0),
            last_len: AtomicUsize::new(0),
        });
        let mut sensor = SimulatedSensor::new("test", small_cfg(50.0));
        sensor.acquisition_start(counter.clone()).unwrap();
        assert!(sensor.is_acquiring());
        assert!(matches!(
            sensor.acquisition_start(counter.clone()),
            Err(Error::AlreadyAcquiring)
        ));
        std::thread::sleep(Duration::from_millis(300));
        sensor.acquisition_stop().unwrap();
        assert!(!sensor.is_acquiring());

        let n = counter.frames.load(Ordering::SeqCst);
        assert!(n >= 5, "only {n} frames in 300 msec at 50 Hz");
        assert_eq!(counter.last_len.load(Ordering::SeqCst), 32 * 16);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.frames.load(Ordering::SeqCst), n);
    }

    #[test]
    fn zero_rate_delivers_nothing() {
        let counter = Arc::new(Counter {
            frames: AtomicUsize::new(0),
            last_len: AtomicUsize::new(0),
        });
        let mut sensor = SimulatedSensor::new("idle", small_cfg(0.0));
        sensor.acquisition_start(counter.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        sensor.acquisition_stop().unwrap();
        assert_eq!(counter.frames.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn source_follows_gain() {
        let cfg = SimulatedSensorConfig {
            noise_amplitude: 0,
            ..small_cfg(1.0)
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let low = render_frame(&cfg, GainMode::Low, 0, &mut rng);
        let high = render_frame(&cfg, GainMode::High, 0, &mut rng);
        let center = 8 * 32 + 16;
        assert_eq!(low[0], cfg.background_level);
        assert_eq!(high[0], cfg.background_level);
        assert!(high[center] > low[center]);
    }

    #[test]
    fn gain_mode_round_trip() {
        let mut sensor = SimulatedSensor::new("gain", small_cfg(0.0));
        assert_eq!(sensor.gain_mode().unwrap(), GainMode::Auto);
        sensor.set_gain_mode(GainMode::Manual).unwrap();
        assert_eq!(sensor.gain_mode().unwrap(), GainMode::Manual);
    }
}
