//! One TCP peer link: framed send/receive, deterministic close, events fanned out to log sinks.
//!
//! The stream is split into read and write halves behind separate locks, so a
//! monitor task can sit in `receive()` while the periodic loop calls `send()`.
//! `close()` flips a watch flag that every blocked operation selects on.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use iot_core::wire::{self, FrameDecodeError, FrameEncodeError};
use iot_core::{LogSink, LogSinks};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

/// Outbound dials give up after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer unreachable, refused, unknown host, or timed out.
#[derive(Debug, thiserror::Error)]
#[error("failed to connect to {addr}: {source}")]
pub struct ConnectError {
    pub addr: String,
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// Closed locally, before or during the read.
    #[error("connection is closed")]
    Closed,
    /// Remote end hung up.
    #[error("remote closed the connection")]
    Disconnected,
    #[error("read failed: {0}")]
    Io(io::Error),
    /// A whole frame arrived but could not be decoded; the stream is still aligned.
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
}

impl ReceiveError {
    /// Terminal errors mean no more frames will ever arrive on this connection.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReceiveError::Frame(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to close connection to {peer}: {source}")]
pub struct CloseError {
    pub peer: SocketAddr,
    pub source: io::Error,
}

/// Exclusive owner of one TCP stream.
pub struct Connection {
    id: Uuid,
    remote: SocketAddr,
    local: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    sinks: LogSinks,
}

impl Connection {
    /// Dial `host:port`. No handshake is sent; callers compose sends afterwards.
    /// A failed dial is reported to `sinks` before the error is returned.
    pub async fn connect(
        host: &str,
        port: u16,
        sinks: Vec<Arc<dyn LogSink>>,
    ) -> Result<Connection, ConnectError> {
        let addr = format!("{host}:{port}");
        let dialed = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")));
        let connection = dialed.and_then(|stream| Connection::from_stream(stream, sinks.clone()));
        match connection {
            Ok(conn) => {
                conn.log(&format!("Opened connection to {}", conn.remote));
                Ok(conn)
            }
            Err(source) => {
                LogSinks::with(sinks).emit(&format!("Failed to connect to {addr}"));
                Err(ConnectError { addr, source })
            }
        }
    }

    /// Wrap an already established stream (used by `Listener::accept`).
    pub fn from_stream(stream: TcpStream, sinks: Vec<Arc<dyn LogSink>>) -> io::Result<Connection> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Ok(Connection {
            id: Uuid::new_v4(),
            remote,
            local,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            sinks: LogSinks::with(sinks),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn add_log_sink(&self, sink: Arc<dyn LogSink>) {
        self.sinks.add(sink);
    }

    pub fn remove_log_sink(&self, sink: &Arc<dyn LogSink>) -> bool {
        self.sinks.remove(sink)
    }

    /// Encode `tokens` and write them as one frame. Logs one line either way.
    pub async fn send<S: AsRef<str>>(&self, tokens: &[S]) -> Result<(), SendError> {
        let data = wire::encode(tokens);
        let result = self.write_frame(tokens).await;
        match &result {
            Ok(()) => self.log(&format!("Sent {data} to {}", self.remote)),
            Err(e) => self.log(&format!("Failed to send {data} to {}: {e}", self.remote)),
        }
        result
    }

    async fn write_frame<S: AsRef<str>>(&self, tokens: &[S]) -> Result<(), SendError> {
        let frame = wire::encode_frame(tokens)?;
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(SendError::Closed);
        }
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(SendError::Closed),
        };
        let Some(writer) = guard.as_mut() else {
            return Err(SendError::Closed);
        };
        let written = tokio::select! {
            r = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => Some(r),
            _ = closed.wait_for(|c| *c) => None,
        };
        match written {
            Some(r) => r.map_err(SendError::Io),
            None => Err(SendError::Closed),
        }
    }

    /// Wait for one full frame. Any terminal error (see `ReceiveError::is_terminal`)
    /// means the caller's loop should stop. Logs one line either way.
    pub async fn receive(&self) -> Result<Vec<String>, ReceiveError> {
        let result = self.read_frame().await;
        match &result {
            Ok(tokens) => self.log(&format!(
                "Received {} from {}",
                wire::encode(tokens),
                self.remote
            )),
            Err(e) => self.log(&format!("Failed to receive message from {}: {e}", self.remote)),
        }
        result
    }

    async fn read_frame(&self) -> Result<Vec<String>, ReceiveError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            self.release_reader();
            return Err(ReceiveError::Closed);
        }
        let mut guard = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(ReceiveError::Closed),
        };
        let Some(reader) = guard.as_mut() else {
            return Err(ReceiveError::Closed);
        };
        let read = tokio::select! {
            r = read_one(reader) => Some(r),
            _ = closed.wait_for(|c| *c) => None,
        };
        // close() could not take the read half while we held it.
        if *closed.borrow() {
            guard.take();
        }
        read.unwrap_or(Err(ReceiveError::Closed))
    }

    fn release_reader(&self) {
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    /// Close the stream. The transport is released on every path; a second call is a logged no-op.
    pub async fn close(&self) -> Result<(), CloseError> {
        if self.closed.send_replace(true) {
            self.log(&format!("Connection to {} already closed", self.remote));
            return Ok(());
        }
        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(mut writer) => match writer.shutdown().await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(source) => Err(CloseError {
                    peer: self.remote,
                    source,
                }),
            },
            None => Ok(()),
        };
        self.release_reader();
        match &result {
            Ok(()) => self.log(&format!("Closed connection to {}", self.remote)),
            Err(e) => self.log(&format!(
                "Failed to close connection to {}: {}",
                self.remote, e.source
            )),
        }
        result
    }

    fn log(&self, message: &str) {
        self.sinks.emit(message);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_one(reader: &mut OwnedReadHalf) -> Result<Vec<String>, ReceiveError> {
    let mut header = [0u8; wire::HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(read_error)?;
    let mut payload = vec![0u8; wire::frame_len(header)];
    reader.read_exact(&mut payload).await.map_err(read_error)?;
    Ok(wire::decode_payload(&payload)?)
}

fn read_error(e: io::Error) -> ReceiveError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ReceiveError::Disconnected
    } else {
        ReceiveError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iot_core::BufferedLog;
    use tokio::net::TcpListener;

    async fn pair(sinks: Vec<Arc<dyn LogSink>>) -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dialed, accepted) = tokio::join!(
            Connection::connect("127.0.0.1", port, sinks),
            listener.accept()
        );
        let (stream, _) = accepted.unwrap();
        (dialed.unwrap(), Connection::from_stream(stream, Vec::new()).unwrap())
    }

    #[tokio::test]
    async fn frame_arrives_intact() {
        let (a, b) = pair(Vec::new()).await;
        a.send(&["A", "report", "w:3", "e:7"]).await.unwrap();
        a.send(&["A", "ping"]).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), vec!["A", "report", "w:3", "e:7"]);
        assert_eq!(b.receive().await.unwrap(), vec!["A", "ping"]);
        assert_eq!(a.remote_port(), b.local_port());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn every_attempt_is_logged() {
        let log = Arc::new(BufferedLog::new());
        let (a, b) = pair(vec![log.clone() as Arc<dyn LogSink>]).await;
        let text = log.flush();
        assert!(text.starts_with("Opened connection to 127.0.0.1:"));

        a.send(&["M1", "ping"]).await.unwrap();
        b.send(&["A1", "pong"]).await.unwrap();
        a.receive().await.unwrap();
        a.close().await.unwrap();
        let _ = a.send(&["late"]).await;

        let text = log.flush();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4, "{text}");
        assert!(lines[0].starts_with("Sent M1::_::ping to 127.0.0.1:"));
        assert!(lines[1].starts_with("Received A1::_::pong from 127.0.0.1:"));
        assert!(lines[2].starts_with("Closed connection to 127.0.0.1:"));
        assert!(lines[3].starts_with("Failed to send late to 127.0.0.1:"));
    }

    #[tokio::test]
    async fn removed_sink_stops_receiving() {
        let log = Arc::new(BufferedLog::new());
        let sink: Arc<dyn LogSink> = log.clone();
        let (a, _b) = pair(Vec::new()).await;
        a.add_log_sink(sink.clone());
        a.send(&["one"]).await.unwrap();
        assert!(a.remove_log_sink(&sink));
        a.send(&["two"]).await.unwrap();
        assert_eq!(log.flush().lines().count(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_ops() {
        let (a, _b) = pair(Vec::new()).await;
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(matches!(a.send(&["x"]).await, Err(SendError::Closed)));
        assert!(matches!(a.receive().await, Err(ReceiveError::Closed)));
    }

    #[tokio::test]
    async fn close_unblocks_pending_receive() {
        let (a, _b) = pair(Vec::new()).await;
        let a = Arc::new(a);
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("receive must unblock")
            .unwrap();
        assert!(matches!(result, Err(ReceiveError::Closed)));
    }

    #[tokio::test]
    async fn remote_hangup_is_terminal() {
        let (a, b) = pair(Vec::new()).await;
        drop(b);
        let result = tokio::time::timeout(Duration::from_secs(2), a.receive())
            .await
            .expect("receive must not block forever");
        let err = result.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn bad_utf8_is_not_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (raw, accepted) =
            tokio::join!(TcpStream::connect(("127.0.0.1", port)), listener.accept());
        let mut raw = raw.unwrap();
        let conn = Connection::from_stream(accepted.unwrap().0, Vec::new()).unwrap();

        raw.write_all(&[0, 2, 0xff, 0xfe]).await.unwrap();
        raw.write_all(&wire::encode_frame(&["A1", "ping"]).unwrap()).await.unwrap();

        let err = conn.receive().await.unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(conn.receive().await.unwrap(), vec!["A1", "ping"]);
    }

    #[tokio::test]
    async fn connect_refused_is_logged() {
        // Bind then drop to find a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let log = Arc::new(BufferedLog::new());
        let err = Connection::connect("127.0.0.1", port, vec![log.clone() as Arc<dyn LogSink>])
            .await
            .unwrap_err();
        assert_eq!(err.addr, format!("127.0.0.1:{port}"));
        assert_eq!(log.flush(), format!("Failed to connect to 127.0.0.1:{port}\n"));
    }

    #[tokio::test]
    async fn read_half_released_when_close_races_a_reader() {
        let (a, _b) = pair(Vec::new()).await;
        // Another task holds the read half while close() runs.
        let held = a.reader.lock().await;
        a.close().await.unwrap();
        assert!(held.is_some());
        drop(held);

        assert!(matches!(a.receive().await, Err(ReceiveError::Closed)));
        assert!(a.reader.lock().await.is_none());
    }
}
