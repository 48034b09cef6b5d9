//! The camera as seen by the command dispatcher.
//!
//! [Device] owns the sensor driver, the exposure controller, the status store
//! and the image encoder, and holds the current exposure time and gain. It
//! is the only place these are changed.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use stackcam_sensor::{GainMode, SensorDriver};
use stackcam_types::Verb;

use crate::accumulator::FrameAccumulator;
use crate::config::{CameraConfig, StackcamConfig, TelemetryHeader};
use crate::exposure::{ExposureController, ExposureResult};
use crate::fits::{FitsEncoder, HeaderCard, ImageEncoder};
use crate::status_store::{StatusPaths, StatusStore};
use crate::{Error, Result};

pub struct Device {
    driver: Box<dyn SensorDriver>,
    controller: ExposureController,
    store: Box<dyn StatusStore>,
    encoder: Box<dyn ImageEncoder>,
    paths: StatusPaths,
    camera: CameraConfig,
    telemetry: Vec<TelemetryHeader>,
    image_spool_path: Option<std::path::PathBuf>,
    etime: f64,
    gain: GainMode,
    /// Number of images taken since startup.
    seqnum: u64,
}

impl Device {
    /// Bring up the camera.
    ///
    /// Restores exposure time and gain from the status store, applies the
    /// gain and starts acquisition. Any failure here is fatal.
    pub fn open(
        cfg: &StackcamConfig,
        mut driver: Box<dyn SensorDriver>,
        mut store: Box<dyn StatusStore>,
    ) -> Result<Self> {
        let paths = StatusPaths::new(&cfg.status.prefix);
        for (path, description) in paths.all() {
            store.touch(&path, description)?;
        }

        let limits = cfg.exposure.limits();
        let etime = match store.get(&paths.etime())? {
            Some(value) => match value.trim().parse::<f64>() {
                Ok(etime) if limits.contains(etime) => etime,
                _ => {
                    warn!(
                        "ignoring stored exposure time \"{value}\", using {}",
                        cfg.exposure.default_etime
                    );
                    cfg.exposure.default_etime
                }
            },
            None => cfg.exposure.default_etime,
        };
        let gain = match store.get(&paths.gain())? {
            Some(value) => value.trim().parse::<GainMode>().unwrap_or_else(|e| {
                warn!("ignoring stored gain: {e}");
                cfg.exposure.default_gain
            }),
            None => cfg.exposure.default_gain,
        };

        driver.set_gain_mode(gain)?;

        let accumulator = Arc::new(FrameAccumulator::new());
        driver.acquisition_start(accumulator.clone())?;
        info!(
            "camera {} ({}) {}x{} open, ETIME {etime:.3} GAIN {gain}",
            driver.name(),
            driver.model(),
            driver.width(),
            driver.height()
        );

        let mut device = Self {
            driver,
            controller: ExposureController::new(accumulator, &cfg.exposure),
            store,
            encoder: Box::new(FitsEncoder),
            paths,
            camera: cfg.camera.clone(),
            telemetry: cfg.telemetry.clone(),
            image_spool_path: cfg.exposure.image_spool_path.clone(),
            etime,
            gain,
            seqnum: 0,
        };
        device.store.put(&device.paths.etime(), &format_etime(etime))?;
        device.store.put(&device.paths.gain(), gain.as_str())?;
        Ok(device)
    }

    /// Replace the image encoder.
    pub fn with_encoder(mut self, encoder: Box<dyn ImageEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Publish where the server can be reached. Failure is fatal.
    pub fn announce(&mut self, hostname: &str, ip: IpAddr, port: u16) -> Result<()> {
        self.store.put(&self.paths.hostname(), hostname)?;
        self.store.put(&self.paths.ip_address(), &ip.to_string())?;
        self.store.put(&self.paths.port(), &port.to_string())?;
        self.store.put(&self.paths.server_running(), "true")?;
        info!("announced server at {hostname} ({ip}) port {port}");
        Ok(())
    }

    /// Record that the server stopped.
    pub fn mark_stopped(&mut self) {
        self.persist(&self.paths.server_running(), "false");
    }

    pub fn etime(&self) -> f64 {
        self.etime
    }

    pub fn gain(&self) -> GainMode {
        self.gain
    }

    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn controller(&self) -> &ExposureController {
        &self.controller
    }

    pub fn accumulator(&self) -> &Arc<FrameAccumulator> {
        self.controller.accumulator()
    }

    pub fn store(&self) -> &dyn StatusStore {
        self.store.as_ref()
    }

    // Writes after startup are best effort.
    fn persist(&mut self, path: &str, value: &str) {
        if let Err(e) = self.store.put(path, value) {
            warn!("could not update status {path}: {e}");
        }
    }

    /// Change the exposure time. The stack collected so far is discarded.
    pub fn set_etime(&mut self, etime: f64) -> Result<()> {
        if !self.controller.limits().contains(etime) {
            return Err(Error::validation(Verb::Etime, "Invalid exposure time specified"));
        }
        self.etime = etime;
        self.accumulator().invalidate();
        self.persist(&self.paths.etime(), &format_etime(etime));
        debug!("exposure time set to {etime:.3} s");
        Ok(())
    }

    /// Change the gain mode on the sensor.
    pub fn set_gain(&mut self, gain: GainMode) -> Result<()> {
        self.driver.set_gain_mode(gain)?;
        self.gain = gain;
        self.persist(&self.paths.gain(), gain.as_str());
        debug!("gain set to {gain}");
        Ok(())
    }

    /// Take one exposure at the current settings and encode it.
    pub async fn take_image(&mut self) -> Result<Vec<u8>> {
        self.driver.start_exposure(self.etime, self.gain)?;
        let result = self.controller.capture(self.etime).await?;
        let seqnum = self.seqnum + 1;
        let cards = self.header_cards(&result, seqnum);
        let buf = self.encoder.encode(&result.image, &cards)?;
        if let Some(path) = &self.image_spool_path {
            std::fs::write(path, &buf)?;
            debug!("image written to {}", path.display());
        }
        self.seqnum = seqnum;
        Ok(buf)
    }

    fn header_cards(&self, result: &ExposureResult, seqnum: u64) -> Vec<HeaderCard> {
        let now = chrono::Utc::now();
        let local = now.with_timezone(&chrono::Local);
        let unixtime = now.timestamp_micros() as f64 / 1e6;
        let model = self
            .camera
            .model
            .clone()
            .unwrap_or_else(|| self.driver.model().to_string());

        let mut cards = vec![
            HeaderCard::text(
                "DATE",
                now.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "UTC Date of file creation",
            ),
            HeaderCard::text(
                "LOCTIME",
                local.format("%a %b %d %H:%M:%S %Y").to_string(),
                "Local time",
            ),
            HeaderCard::real("UNIXTIME", unixtime, 6, "Fractional UNIX timestamp"),
            HeaderCard::text("ORIGIN", &self.camera.origin, "Origin of the data"),
            HeaderCard::text("INSTRUME", &self.camera.instrument, "Instrument"),
            HeaderCard::text("CAMMODEL", model, "Camera model"),
        ];
        if let Some(name) = &self.camera.sensor_name {
            cards.push(HeaderCard::text("CCDNAME", name, "Detector name"));
        }
        if let Some(size) = self.camera.pixel_size_um {
            cards.push(HeaderCard::real("PIXSIZE", size, 2, "Pixel size (microns)"));
        }
        cards.extend([
            HeaderCard::real("ETIME", result.etime, 5, "Exposure time (seconds)"),
            HeaderCard::text("GAIN", self.gain.as_str(), "Gain mode"),
            HeaderCard::integer(
                "STACKCNT",
                result.image.frame_count.into(),
                "Number of frames stacked",
            ),
            HeaderCard::integer(
                "SEQNUM",
                seqnum.try_into().unwrap_or(i64::MAX),
                "Image sequence number",
            ),
            HeaderCard::text(
                "EXPSTART",
                result.start.datetime.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
                "UTC exposure start",
            ),
        ]);

        for header in self.telemetry.iter() {
            match self.store.get(&header.status_path) {
                Ok(Some(value)) => {
                    cards.push(HeaderCard::text(&header.key, value, &header.comment))
                }
                Ok(None) => warn!(
                    "no value at {} for header {}",
                    header.status_path, header.key
                ),
                Err(e) => warn!(
                    "reading {} for header {}: {e}",
                    header.status_path, header.key
                ),
            }
        }
        cards
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.driver.acquisition_stop() {
            warn!("stopping acquisition: {e}");
        }
    }
}

/// Exposure times are stored with millisecond precision.
pub fn format_etime(etime: f64) -> String {
    format!("{etime:.3}")
}
