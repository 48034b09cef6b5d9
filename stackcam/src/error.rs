use std::time::Duration;

use stackcam_types::Verb;

pub type Result<T> = std::result::Result<T, Error>;

/// The stackcam server error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A command argument or setting was rejected before anything changed.
    #[error("{reason}")]
    Validation { verb: Option<Verb>, reason: String },
    #[error("device error: {source}")]
    Device {
        #[from]
        source: stackcam_sensor::Error,
    },
    #[error("no frame arrived within {waited:?} of exposure start")]
    Timeout { waited: Duration },
    #[error("exposure already in progress")]
    Busy,
    #[error("image encoding error: {0}")]
    Encode(String),
    #[error("status store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVar {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl Error {
    pub(crate) fn validation(verb: Verb, reason: &str) -> Self {
        Error::Validation {
            verb: Some(verb),
            reason: reason.to_string(),
        }
    }

    /// The reason reported to a client on the reply line.
    pub fn client_reason(&self) -> String {
        match self {
            Error::Validation { reason, .. } => reason.clone(),
            Error::Device { .. } => "Device error".into(),
            Error::Timeout { .. } => "Exposure timeout".into(),
            Error::Busy => "Exposure already in progress".into(),
            Error::Encode(_) | Error::Io { .. } => {
                "Unable to save temporary file on the camera server".into()
            }
            Error::Store(_)
            | Error::Config(_)
            | Error::Json { .. }
            | Error::TomlDe { .. }
            | Error::ShellExpandLookupVar { .. } => "Server configuration error".into(),
        }
    }
}
