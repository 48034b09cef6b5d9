//! Server configuration, read from a `.toml` file.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) gives a working server on port 915 with a simulated sensor. Print the
//! defaults with `stackcam --print-default-config`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stackcam_sensor::sim::SimulatedSensorConfig;
use stackcam_types::{
    DEFAULT_ETIME, DEFAULT_MAX_ETIME, DEFAULT_MIN_ETIME, DEFAULT_PORT, ExposureLimits, GainMode,
};

use crate::{Error, Result};

/// The default value for [ServerConfig::send_chunk_size].
pub const DEFAULT_SEND_CHUNK_SIZE: usize = 5000;

/// The default value for [ExposureConfig::expose_timeout_secs].
pub const DEFAULT_EXPOSE_TIMEOUT_SECS: f64 = 30.0;

/// The default value for [StatusConfig::store_path].
pub const DEFAULT_STATUS_STORE_PATH: &str = "stackcam-status.json";

fn default_listen_addr() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_send_chunk_size() -> usize {
    DEFAULT_SEND_CHUNK_SIZE
}

fn default_max_line_length() -> usize {
    1024
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_min_etime() -> f64 {
    DEFAULT_MIN_ETIME
}

fn default_max_etime() -> f64 {
    DEFAULT_MAX_ETIME
}

fn default_etime() -> f64 {
    DEFAULT_ETIME
}

fn default_expose_timeout_secs() -> f64 {
    DEFAULT_EXPOSE_TIMEOUT_SECS
}

fn default_output_scale() -> f64 {
    1.0
}

fn default_instrument() -> String {
    "STACKCAM".to_string()
}

fn default_origin() -> String {
    "stackcam".to_string()
}

fn default_store_path() -> PathBuf {
    DEFAULT_STATUS_STORE_PATH.into()
}

fn default_status_prefix() -> String {
    "/i/stackcam".to_string()
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is expanded
/// to the home directory.
fn fixup_relative_path(path: &mut PathBuf, dirname: &Path) -> Result<()> {
    let pathstr = path
        .to_str()
        .ok_or_else(|| Error::Config(format!("path {} is not utf-8", path.display())))?;
    let expanded = shellexpand::full(pathstr)?;
    *path = PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

/// Network settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on, in the format `IP:PORT`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Largest number of image bytes written to a socket in one step.
    #[serde(default = "default_send_chunk_size")]
    pub send_chunk_size: usize,
    /// Longest accepted command line, in bytes.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Network interface whose IPv4 address is published in the status
    /// store.
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            send_chunk_size: default_send_chunk_size(),
            max_line_length: default_max_line_length(),
            interface: default_interface(),
        }
    }
}

/// Exposure settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureConfig {
    /// Shortest accepted exposure time (seconds).
    #[serde(default = "default_min_etime")]
    pub min_etime: f64,
    /// Longest accepted exposure time (seconds).
    #[serde(default = "default_max_etime")]
    pub max_etime: f64,
    /// Exposure time used when the status store holds none.
    #[serde(default = "default_etime")]
    pub default_etime: f64,
    /// An exposure fails if no frame at all arrived this long after it
    /// started.
    #[serde(default = "default_expose_timeout_secs")]
    pub expose_timeout_secs: f64,
    /// Multiplier applied to the stacked image before conversion to 16 bit.
    #[serde(default = "default_output_scale")]
    pub output_scale: f64,
    /// Gain mode used when the status store holds none.
    #[serde(default)]
    pub default_gain: GainMode,
    /// If set, each encoded image is also written to this file.
    ///
    /// Can contain shell variables such as `~`, `$A`, or `${B}`.
    pub image_spool_path: Option<PathBuf>,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            min_etime: default_min_etime(),
            max_etime: default_max_etime(),
            default_etime: default_etime(),
            expose_timeout_secs: default_expose_timeout_secs(),
            output_scale: default_output_scale(),
            default_gain: GainMode::default(),
            image_spool_path: None,
        }
    }
}

impl ExposureConfig {
    pub fn limits(&self) -> ExposureLimits {
        ExposureLimits {
            min: self.min_etime,
            max: self.max_etime,
        }
    }
}

/// Descriptive camera metadata written into each image header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    /// Camera model. Defaults to the model reported by the driver.
    pub model: Option<String>,
    #[serde(default = "default_instrument")]
    pub instrument: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Name of the detector chip.
    pub sensor_name: Option<String>,
    /// Pixel pitch in microns.
    pub pixel_size_um: Option<f64>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: None,
            instrument: default_instrument(),
            origin: default_origin(),
            sensor_name: None,
            pixel_size_um: None,
        }
    }
}

/// Parameters of the simulated sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate_hz: f64,
    pub background_level: u16,
    pub noise_amplitude: u16,
}

impl Default for SensorConfig {
    fn default() -> Self {
        let sim = SimulatedSensorConfig::default();
        Self {
            width: sim.width,
            height: sim.height,
            frame_rate_hz: sim.frame_rate_hz,
            background_level: sim.background_level,
            noise_amplitude: sim.noise_amplitude,
        }
    }
}

impl SensorConfig {
    pub fn to_simulated(&self, camera: &CameraConfig) -> SimulatedSensorConfig {
        let mut sim = SimulatedSensorConfig {
            width: self.width,
            height: self.height,
            frame_rate_hz: self.frame_rate_hz,
            background_level: self.background_level,
            noise_amplitude: self.noise_amplitude,
            ..Default::default()
        };
        if let Some(model) = &camera.model {
            sim.model = model.clone();
        }
        sim
    }
}

/// Location of the shared status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    /// JSON file holding the status entries. Relative paths are relative to
    /// the configuration file.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    /// Prefix of every key this server writes, e.g. `/i/stackcam`.
    #[serde(default = "default_status_prefix")]
    pub prefix: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            prefix: default_status_prefix(),
        }
    }
}

/// An extra image header card copied from the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryHeader {
    /// Header keyword, at most eight characters.
    pub key: String,
    /// Status store key the value is read from.
    pub status_path: String,
    #[serde(default)]
    pub comment: String,
}

/// The complete server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackcamConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub telemetry: Vec<TelemetryHeader>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Config(msg.into())
}

impl StackcamConfig {
    /// Check cross-field constraints which serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let exp = &self.exposure;
        if !(exp.min_etime > 0.0 && exp.min_etime <= exp.max_etime) {
            return Err(invalid(format!(
                "exposure limits {}..{} are not an ascending positive range",
                exp.min_etime, exp.max_etime
            )));
        }
        if !exp.limits().contains(exp.default_etime) {
            return Err(invalid(format!(
                "default_etime {} outside {}..{}",
                exp.default_etime, exp.min_etime, exp.max_etime
            )));
        }
        if !(exp.expose_timeout_secs.is_finite() && exp.expose_timeout_secs > 0.0) {
            return Err(invalid("expose_timeout_secs must be positive"));
        }
        if !(exp.output_scale.is_finite() && exp.output_scale > 0.0) {
            return Err(invalid("output_scale must be positive"));
        }
        if self.server.send_chunk_size == 0 {
            return Err(invalid("send_chunk_size must not be zero"));
        }
        if self.server.max_line_length == 0 {
            return Err(invalid("max_line_length must not be zero"));
        }
        if self.sensor.width == 0 || self.sensor.height == 0 {
            return Err(invalid("sensor dimensions must not be zero"));
        }
        for header in self.telemetry.iter() {
            crate::fits::check_keyword(&header.key)
                .map_err(|e| invalid(format!("telemetry header: {e}")))?;
        }
        Ok(())
    }

    /// For all paths which are relative, make them relative to `dirname`.
    fn fixup_relative_paths(&mut self, dirname: &Path) -> Result<()> {
        fixup_relative_path(&mut self.status.store_path, dirname)?;
        if let Some(spool) = self.exposure.image_spool_path.as_mut() {
            fixup_relative_path(spool, dirname)?;
        }
        Ok(())
    }

    /// The default configuration with paths resolved against the current
    /// directory.
    pub fn default_in_cwd() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.fixup_relative_paths(&std::env::current_dir()?)?;
        Ok(cfg)
    }
}

/// Parse a `.toml` string. Relative paths are resolved against `dirname`.
pub fn parse_config_str(contents: &str, dirname: &Path) -> Result<StackcamConfig> {
    let mut cfg: StackcamConfig = toml::from_str(contents)?;
    cfg.fixup_relative_paths(dirname)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parse a `.toml` file and return a [StackcamConfig] structure.
pub fn parse_config_file<P: AsRef<Path>>(fname: P) -> Result<StackcamConfig> {
    let fname = fname.as_ref();
    let contents = std::fs::read_to_string(fname)?;
    let dirname = match fname.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    tracing::debug!("parsing config file {}", fname.display());
    parse_config_str(&contents, &dirname)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_config_str("", Path::new("/etc/stackcam")).unwrap();
        assert_eq!(cfg.server, ServerConfig::default());
        assert_eq!(cfg.exposure, ExposureConfig::default());
        assert_eq!(cfg.server.listen_addr, "0.0.0.0:915");
        assert_eq!(cfg.server.send_chunk_size, 5000);
        assert_eq!(
            cfg.status.store_path,
            PathBuf::from("/etc/stackcam/stackcam-status.json")
        );
    }

    #[test]
    fn full_file() {
        let toml_buf = r#"
            [server]
            listen_addr = "127.0.0.1:9150"
            interface = "lo"

            [exposure]
            min_etime = 0.5
            max_etime = 60.0
            default_etime = 2.0
            expose_timeout_secs = 5.0
            output_scale = 0.4
            default_gain = "HIGH"
            image_spool_path = "spool/image.fits"

            [camera]
            model = "Tau 2"
            sensor_name = "UL 04 17 1"
            pixel_size_um = 17.0

            [sensor]
            width = 320
            height = 256
            frame_rate_hz = 30.0
            background_level = 1000
            noise_amplitude = 0

            [status]
            store_path = "/var/run/stackcam/status.json"
            prefix = "/i/taucam"

            [[telemetry]]
            key = "DOMEAZ"
            status_path = "/t/dome/azimuth"
            comment = "Dome azimuth"
        "#;
        let cfg = parse_config_str(toml_buf, Path::new("/srv")).unwrap();
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:9150");
        assert_eq!(cfg.exposure.output_scale, 0.4);
        assert_eq!(cfg.exposure.default_gain, GainMode::High);
        assert_eq!(
            cfg.exposure.image_spool_path,
            Some(PathBuf::from("/srv/spool/image.fits"))
        );
        assert_eq!(cfg.exposure.limits().min, 0.5);
        assert_eq!(cfg.camera.sensor_name.as_deref(), Some("UL 04 17 1"));
        assert_eq!(cfg.sensor.to_simulated(&cfg.camera).model, "Tau 2");
        assert_eq!(
            cfg.status.store_path,
            PathBuf::from("/var/run/stackcam/status.json")
        );
        assert_eq!(cfg.telemetry.len(), 1);
        assert_eq!(cfg.telemetry[0].key, "DOMEAZ");
    }

    #[test]
    fn unknown_field_rejected() {
        let toml_buf = "[server]\nport = 915\n";
        assert!(matches!(
            parse_config_str(toml_buf, Path::new("/")),
            Err(Error::TomlDe { .. })
        ));
    }

    #[test]
    fn inconsistent_limits_rejected() {
        let toml_buf = "[exposure]\nmin_etime = 10.0\nmax_etime = 1.0\n";
        assert!(matches!(
            parse_config_str(toml_buf, Path::new("/")),
            Err(Error::Config(_))
        ));
        let toml_buf = "[exposure]\ndefault_etime = 1000.0\n";
        assert!(matches!(
            parse_config_str(toml_buf, Path::new("/")),
            Err(Error::Config(_))
        ));
        let toml_buf = "[exposure]\noutput_scale = 0.0\n";
        assert!(matches!(
            parse_config_str(toml_buf, Path::new("/")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn bad_telemetry_keyword_rejected() {
        let toml_buf = "[[telemetry]]\nkey = \"DOMEAZIMUTH\"\nstatus_path = \"/t/az\"\n";
        assert!(matches!(
            parse_config_str(toml_buf, Path::new("/")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = StackcamConfig::default();
        let buf = toml::to_string(&cfg).unwrap();
        let parsed: StackcamConfig = toml::from_str(&buf).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let fname = dir.path().join("stackcam.toml");
        std::fs::write(&fname, "[status]\nstore_path = \"state/status.json\"\n").unwrap();
        let cfg = parse_config_file(&fname).unwrap();
        assert_eq!(cfg.status.store_path, dir.path().join("state/status.json"));
    }
}
