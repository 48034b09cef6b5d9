use tracing::{info, warn};

use stackcam_types::{Reply, Verb};

use crate::command::Command;
use crate::device::Device;
use crate::Error;

/// What a session does after one command line.
#[derive(Debug)]
pub struct Response {
    pub reply: Reply,
    /// Bytes to stream after the reply line.
    pub payload: Option<Vec<u8>>,
    /// Close the session after the reply.
    pub close: bool,
}

impl Response {
    fn reply(reply: Reply) -> Self {
        Self {
            reply,
            payload: None,
            close: false,
        }
    }
}

/// Turns command lines into actions on the [Device] and reply lines.
pub struct CommandDispatcher {
    device: Device,
}

impl CommandDispatcher {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn into_device(self) -> Device {
        self.device
    }

    pub async fn handle_line(&mut self, line: &str) -> Response {
        let limits = self.device.controller().limits();
        match Command::parse(line, &limits) {
            Ok(cmd) => self.execute(cmd).await,
            Err(e) => {
                let reply = match e {
                    Error::Validation {
                        verb: Some(verb),
                        reason,
                    } => Reply::fail(verb, reason),
                    _ => Reply::syntax_error(),
                };
                info!("rejected {line:?}: {reply}");
                Response::reply(reply)
            }
        }
    }

    pub async fn execute(&mut self, cmd: Command) -> Response {
        let verb = cmd.verb();
        let result = match cmd {
            Command::Image => match self.device.take_image().await {
                Ok(buf) => {
                    info!("IMAGE: sending {} bytes", buf.len());
                    return Response {
                        reply: Reply::image_bytes(buf.len()),
                        payload: Some(buf),
                        close: false,
                    };
                }
                Err(e) => Err(e),
            },
            Command::Etime(etime) => self.device.set_etime(etime),
            Command::Gain(gain) => self.device.set_gain(gain),
            Command::Quit => {
                return Response {
                    reply: Reply::ok(Verb::Quit),
                    payload: None,
                    close: true,
                };
            }
        };
        match result {
            Ok(()) => Response::reply(Reply::ok(verb)),
            Err(e) => {
                warn!("{verb} failed: {e}");
                Response::reply(failure_reply(verb, &e))
            }
        }
    }
}

/// The reply line for a command that failed with `e`.
pub fn failure_reply(verb: Verb, e: &Error) -> Reply {
    let reason = match (verb, e) {
        (_, Error::Validation { verb: None, .. }) => return Reply::syntax_error(),
        (Verb::Image, Error::Device { .. }) => "Unable to start exposure".to_string(),
        (Verb::Gain, Error::Device { .. }) => "Unable to set gain mode".to_string(),
        _ => e.client_reason(),
    };
    Reply::fail(verb, reason)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use stackcam_sensor::sim::{SimulatedSensor, SimulatedSensorConfig};
    use test_log::test;

    use crate::config::StackcamConfig;
    use crate::status_store::MemoryStore;

    fn dispatcher(frame_rate_hz: f64) -> CommandDispatcher {
        let mut cfg = StackcamConfig::default();
        cfg.exposure.expose_timeout_secs = 0.3;
        let sensor = SimulatedSensor::new(
            "dispatch-test",
            SimulatedSensorConfig {
                width: 16,
                height: 8,
                frame_rate_hz,
                ..Default::default()
            },
        );
        let device = Device::open(&cfg, Box::new(sensor), Box::new(MemoryStore::new())).unwrap();
        CommandDispatcher::new(device)
    }

    async fn reply_line(d: &mut CommandDispatcher, line: &str) -> String {
        d.handle_line(line).await.reply.to_string()
    }

    #[test(tokio::test)]
    async fn settings_replies() {
        let mut d = dispatcher(20.0);
        assert_eq!(reply_line(&mut d, "ETIME 0.25").await, ". ETIME");
        assert_eq!(d.device().etime(), 0.25);
        assert_eq!(reply_line(&mut d, "gain high").await, ". GAIN");
        assert_eq!(
            reply_line(&mut d, "ETIME").await,
            "! ETIME \"Argument not specified\""
        );
        assert_eq!(
            reply_line(&mut d, "ETIME 1000").await,
            "! ETIME \"Invalid exposure time specified\""
        );
        assert_eq!(d.device().etime(), 0.25);
        assert_eq!(
            reply_line(&mut d, "GAIN turbo").await,
            "! GAIN \"Invalid gain argument specified\""
        );
        assert_eq!(reply_line(&mut d, "").await, "! \"Syntax error\"");
        assert_eq!(reply_line(&mut d, "HELLO").await, "! \"Syntax error\"");
    }

    #[test(tokio::test)]
    async fn quit_closes() {
        let mut d = dispatcher(20.0);
        for line in ["QUIT", "bye", "EXIT", "logout"] {
            let response = d.handle_line(line).await;
            assert_eq!(response.reply.to_string(), ". QUIT");
            assert!(response.close);
        }
    }

    #[test(tokio::test)]
    async fn image_reply_announces_payload_length() {
        let mut d = dispatcher(20.0);
        assert_eq!(reply_line(&mut d, "ETIME 0.2").await, ". ETIME");
        let response = d.handle_line("IMAGE").await;
        let payload = response.payload.unwrap();
        assert_eq!(response.reply.to_string(), format!(". {}", payload.len()));
        assert!(!response.close);
        assert!(payload.starts_with(b"SIMPLE  ="));
    }

    #[test(tokio::test)]
    async fn image_timeout_reply() {
        let mut d = dispatcher(0.0);
        assert_eq!(reply_line(&mut d, "ETIME 0.1").await, ". ETIME");
        let t0 = std::time::Instant::now();
        let response = d.handle_line("IMAGE").await;
        assert!(t0.elapsed() >= Duration::from_millis(300));
        assert_eq!(
            response.reply.to_string(),
            "! IMAGE \"Exposure timeout\""
        );
        assert!(response.payload.is_none());
    }

    #[test]
    fn failure_reasons() {
        let device_err = Error::from(stackcam_sensor::Error::from("usb"));
        assert_eq!(
            failure_reply(Verb::Image, &device_err).to_string(),
            "! IMAGE \"Unable to start exposure\""
        );
        assert_eq!(
            failure_reply(Verb::Gain, &device_err).to_string(),
            "! GAIN \"Unable to set gain mode\""
        );
        assert_eq!(
            failure_reply(Verb::Image, &Error::Busy).to_string(),
            "! IMAGE \"Exposure already in progress\""
        );
        let io_err = Error::from(std::io::Error::other("disk full"));
        assert_eq!(
            failure_reply(Verb::Image, &io_err).to_string(),
            "! IMAGE \"Unable to save temporary file on the camera server\""
        );
    }
}
