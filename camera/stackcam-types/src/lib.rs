//! Core types shared by the stackcam exposure server and its clients.
//!
//! This covers the sensor gain modes, the exposure time limits and the line
//! oriented command protocol spoken over TCP.

use serde::{Deserialize, Serialize};

/// Character prefixing a successful reply line.
pub const PASS_CHAR: char = '.';
/// Character prefixing a failed reply line.
pub const FAIL_CHAR: char = '!';

/// The default TCP port of the server.
pub const DEFAULT_PORT: u16 = 915;

/// Shortest exposure time accepted by default (seconds).
pub const DEFAULT_MIN_ETIME: f64 = 0.1;
/// Longest exposure time accepted by default (seconds).
pub const DEFAULT_MAX_ETIME: f64 = 600.0;
/// Exposure time in effect before any `ETIME` command (seconds).
pub const DEFAULT_ETIME: f64 = 1.0;

/// Sensor amplification setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum GainMode {
    /// The sensor chooses its own gain.
    #[default]
    Auto,
    /// Fixed high gain.
    High,
    /// Fixed low gain.
    Low,
    /// Gain set manually on the sensor.
    Manual,
}

impl GainMode {
    /// All gain modes, in protocol order.
    pub fn variants() -> Vec<Self> {
        vec![GainMode::Auto, GainMode::High, GainMode::Low, GainMode::Manual]
    }

    /// The protocol token for this mode, e.g. `"AUTO"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            GainMode::Auto => "AUTO",
            GainMode::High => "HIGH",
            GainMode::Low => "LOW",
            GainMode::Manual => "MANUAL",
        }
    }
}

impl std::fmt::Display for GainMode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

/// Error returned when a gain token is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownGainMode(pub String);

impl std::fmt::Display for UnknownGainMode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        write!(fmt, "unknown gain mode \"{}\"", self.0)
    }
}

impl std::error::Error for UnknownGainMode {}

impl std::str::FromStr for GainMode {
    type Err = UnknownGainMode;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GainMode::variants()
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownGainMode(s.to_string()))
    }
}

/// The inclusive range of accepted exposure times, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureLimits {
    pub min: f64,
    pub max: f64,
}

impl ExposureLimits {
    /// Returns `true` if `etime` lies within the limits. `NaN` never does.
    pub fn contains(&self, etime: f64) -> bool {
        (self.min..=self.max).contains(&etime)
    }
}

impl Default for ExposureLimits {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_ETIME,
            max: DEFAULT_MAX_ETIME,
        }
    }
}

/// A command verb of the text protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Take an exposure and stream the image back.
    Image,
    /// Set the exposure time.
    Etime,
    /// Set the gain mode.
    Gain,
    /// Close the session. Also spelled `BYE`, `EXIT` and `LOGOUT`.
    Quit,
}

impl Verb {
    /// Look up a verb, ignoring ASCII case and accepting the quit aliases.
    pub fn from_token(token: &str) -> Option<Self> {
        const TABLE: &[(&str, Verb)] = &[
            ("IMAGE", Verb::Image),
            ("ETIME", Verb::Etime),
            ("GAIN", Verb::Gain),
            ("QUIT", Verb::Quit),
            ("BYE", Verb::Quit),
            ("EXIT", Verb::Quit),
            ("LOGOUT", Verb::Quit),
        ];
        TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, verb)| *verb)
    }

    /// Canonical spelling used in replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Image => "IMAGE",
            Verb::Etime => "ETIME",
            Verb::Gain => "GAIN",
            Verb::Quit => "QUIT",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        fmt.write_str(self.as_str())
    }
}

/// One reply line sent from the server to a client.
///
/// The `Display` implementation produces the line without its terminating
/// newline, e.g. `. ETIME`, `. 1059840` or `! GAIN "Argument not specified"`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Success with a payload (echoed verb or byte count).
    Pass(String),
    /// Failure with a human readable reason.
    Fail {
        verb: Option<Verb>,
        reason: String,
    },
}

impl Reply {
    /// Success reply echoing `verb`.
    pub fn ok(verb: Verb) -> Self {
        Reply::Pass(verb.as_str().to_string())
    }

    /// Success reply announcing `nbytes` of binary data to follow.
    pub fn image_bytes(nbytes: usize) -> Self {
        Reply::Pass(nbytes.to_string())
    }

    /// Failure reply for a known verb.
    pub fn fail(verb: Verb, reason: impl Into<String>) -> Self {
        Reply::Fail {
            verb: Some(verb),
            reason: reason.into(),
        }
    }

    /// The generic reply to anything unparseable.
    pub fn syntax_error() -> Self {
        Reply::Fail {
            verb: None,
            reason: "Syntax error".into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Reply::Pass(_))
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        match self {
            Reply::Pass(payload) => write!(fmt, "{PASS_CHAR} {payload}"),
            Reply::Fail {
                verb: Some(verb),
                reason,
            } => write!(fmt, "{FAIL_CHAR} {verb} \"{}\"", quote_safe(reason)),
            Reply::Fail { verb: None, reason } => {
                write!(fmt, "{FAIL_CHAR} \"{}\"", quote_safe(reason))
            }
        }
    }
}

// Reasons must stay on one line and inside their quotes.
fn quote_safe(reason: &str) -> String {
    reason
        .chars()
        .map(|c| match c {
            '"' => '\'',
            '\r' | '\n' => ' ',
            c => c,
        })
        .collect()
}
