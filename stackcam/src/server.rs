//! TCP front end.
//!
//! Every client connection gets its own task. Command lines are forwarded
//! over a channel to a single device task which owns the
//! [CommandDispatcher], so commands from all clients execute one at a time in
//! arrival order. An `IMAGE` sent while another is running simply waits its
//! turn. Replies go back to the requesting session, which writes the reply
//! line and, for images, streams the payload before reading its next line.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use stream_cancel::Valve;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use stackcam_types::Reply;

use crate::config::ServerConfig;
use crate::dispatcher::{CommandDispatcher, Response};
use crate::session::{ClientSession, SessionInfo};
use crate::{Error, Result, netinfo};

/// Number of command lines which may wait for the device task.
const DEVICE_QUEUE_LEN: usize = 32;

struct DeviceRequest {
    session_id: u64,
    line: String,
    reply_tx: oneshot::Sender<Response>,
}

/// The connected sessions, shared between the session tasks.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<BTreeMap<u64, SessionInfo>>>,
}

impl SessionRegistry {
    fn update(&self, session: &ClientSession) {
        self.inner.lock().insert(session.id(), session.info());
    }

    fn remove(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    /// Snapshot of all sessions, in connection order.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One line received from a client.
#[derive(Debug, PartialEq)]
enum ClientLine {
    Text(String),
    /// A complete line which is not valid UTF-8.
    NotUtf8,
}

/// [LinesCodec] which yields undecodable lines as [ClientLine::NotUtf8]
/// instead of failing the stream.
struct ClientLineCodec {
    inner: LinesCodec,
}

impl ClientLineCodec {
    fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn convert(
        result: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<ClientLine>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(ClientLine::Text)),
            // The line was already removed from the buffer.
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(ClientLine::NotUtf8))
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for ClientLineCodec {
    type Item = ClientLine;
    type Error = LinesCodecError;

    fn decode(
        &mut self,
        buf: &mut bytes::BytesMut,
    ) -> std::result::Result<Option<ClientLine>, LinesCodecError> {
        Self::convert(self.inner.decode(buf))
    }

    fn decode_eof(
        &mut self,
        buf: &mut bytes::BytesMut,
    ) -> std::result::Result<Option<ClientLine>, LinesCodecError> {
        Self::convert(self.inner.decode_eof(buf))
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionOptions {
    send_chunk_size: usize,
    max_line_length: usize,
}

pub struct StackcamServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    opts: SessionOptions,
    registry: SessionRegistry,
}

impl StackcamServer {
    /// Open the listening socket.
    pub async fn bind(cfg: &ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(cfg.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
            opts: SessionOptions {
                send_chunk_size: cfg.send_chunk_size.max(1),
                max_line_length: cfg.max_line_length,
            },
            registry: SessionRegistry::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the list of connected sessions.
    pub fn sessions(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Serve clients until `shutdown` completes.
    ///
    /// Returns the dispatcher once every session has ended and the device
    /// task has drained its queue.
    pub async fn run<F>(self, dispatcher: CommandDispatcher, shutdown: F) -> Result<CommandDispatcher>
    where
        F: Future<Output = ()>,
    {
        let (to_device, device_rx) = mpsc::channel(DEVICE_QUEUE_LEN);
        let device_task = tokio::spawn(run_device(dispatcher, device_rx));

        // Cancelling ends the line streams of all sessions.
        let (quit_trigger, valve) = Valve::new();
        let mut sessions = tokio::task::JoinSet::new();
        let mut next_session_id = 0u64;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down with {} session(s) connected", self.registry.len());
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_session_id += 1;
                        sessions.spawn(serve_session(
                            stream,
                            addr,
                            next_session_id,
                            to_device.clone(),
                            valve.clone(),
                            self.opts,
                            self.registry.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("session task failed: {e}");
                    }
                }
            }
        }

        quit_trigger.cancel();
        drop(to_device);
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("session task failed: {e}");
            }
        }
        device_task.await.map_err(|e| Error::Io {
            source: std::io::Error::other(e),
        })
    }
}

async fn run_device(
    mut dispatcher: CommandDispatcher,
    mut rx: mpsc::Receiver<DeviceRequest>,
) -> CommandDispatcher {
    while let Some(req) = rx.recv().await {
        let response = dispatcher.handle_line(&req.line).await;
        if req.reply_tx.send(response).is_err() {
            debug!("session {} left before its reply", req.session_id);
        }
    }
    debug!("device task done");
    dispatcher
}

async fn serve_session(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    to_device: mpsc::Sender<DeviceRequest>,
    valve: Valve,
    opts: SessionOptions,
    registry: SessionRegistry,
) {
    let hostname = netinfo::peer_hostname(addr.ip()).await;
    let mut session = ClientSession::new(id, addr, hostname);
    registry.update(&session);
    info!("session {id}: connection from {} ({addr})", session.hostname());

    let result = session_loop(&mut session, stream, to_device, valve, opts, &registry).await;
    registry.remove(id);

    let duration = chrono::Utc::now() - session.connected_at();
    let seconds = duration.num_milliseconds() as f64 / 1000.0;
    match result {
        Ok(()) => info!(
            "session {id}: {} disconnected after {seconds:.1} s",
            session.hostname()
        ),
        Err(e) => warn!(
            "session {id}: {} dropped after {seconds:.1} s: {e}",
            session.hostname()
        ),
    }
}

async fn session_loop(
    session: &mut ClientSession,
    stream: TcpStream,
    to_device: mpsc::Sender<DeviceRequest>,
    valve: Valve,
    opts: SessionOptions,
    registry: &SessionRegistry,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let lines = valve.wrap(FramedRead::new(
        reader,
        ClientLineCodec::new(opts.max_line_length),
    ));
    tokio::pin!(lines);

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(ClientLine::Text(line)) => line,
            Ok(ClientLine::NotUtf8) => {
                warn!("session {}: line is not valid UTF-8", session.id());
                write_reply(&mut writer, &Reply::syntax_error()).await?;
                continue;
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                // The line stream ends after any error.
                warn!("session {}: line too long", session.id());
                write_reply(&mut writer, &Reply::syntax_error()).await?;
                break;
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };
        debug!("session {}: RECV< {line}", session.id());

        let (reply_tx, reply_rx) = oneshot::channel();
        let req = DeviceRequest {
            session_id: session.id(),
            line,
            reply_tx,
        };
        if to_device.send(req).await.is_err() {
            break;
        }
        let Ok(response) = reply_rx.await else {
            break;
        };

        write_reply(&mut writer, &response.reply).await?;
        if let Some(payload) = response.payload {
            let total = session.begin_streaming(payload);
            registry.update(session);
            stream_payload(session, &mut writer, opts.send_chunk_size).await?;
            debug!("session {}: sent {total} image bytes", session.id());
            registry.update(session);
        }
        if response.close {
            session.request_close();
            writer.shutdown().await?;
            break;
        }
    }
    Ok(())
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> Result<()> {
    debug!("SEND> {reply}");
    writer.write_all(format!("{reply}\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn stream_payload<W: AsyncWrite + Unpin>(
    session: &mut ClientSession,
    writer: &mut W,
    chunk_size: usize,
) -> Result<()> {
    loop {
        let chunk = session.pending_chunk(chunk_size);
        if chunk.is_empty() {
            break;
        }
        let n = writer.write(chunk).await?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        session.advance(n);
    }
    writer.flush().await?;
    session.finish_streaming();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn payload_is_streamed_whole() {
        let mut session = ClientSession::new(7, "127.0.0.1:1".parse().unwrap(), "x".into());
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        session.begin_streaming(payload.clone());
        let mut out = Vec::new();
        stream_payload(&mut session, &mut out, 5000).await.unwrap();
        assert_eq!(out, payload);
        assert!(session.accepts_commands());
    }

    #[test]
    fn undecodable_lines_are_skipped() {
        let mut codec = ClientLineCodec::new(64);
        let mut buf = bytes::BytesMut::from(&b"ETIME \xff\xfe\nGAIN LOW\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ClientLine::NotUtf8));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ClientLine::Text("GAIN LOW".into()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        let mut buf = bytes::BytesMut::from(&b"\xc3"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(ClientLine::NotUtf8));
    }

    #[tokio::test]
    async fn reply_lines_end_in_newline() {
        let mut out = Vec::new();
        write_reply(&mut out, &Reply::image_bytes(42)).await.unwrap();
        assert_eq!(out, b". 42\n");
    }
}
