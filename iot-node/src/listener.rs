//! Inbound side: bind one port, accept streams, wrap each as a `Connection`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use iot_core::{LogSink, LogSinks};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};

use crate::connection::Connection;

#[derive(Debug, thiserror::Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    pub source: io::Error,
}

impl BindError {
    /// Platform reason, e.g. `AddrInUse` or `PermissionDenied`.
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener was closed; no more connections will be accepted.
    #[error("listener is closed")]
    Closed,
    /// One accept failed; the listener is still usable.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

pub struct Listener {
    local: SocketAddr,
    inner: Mutex<Option<TcpListener>>,
    closed: watch::Sender<bool>,
    sinks: LogSinks,
}

impl Listener {
    /// Bind `host:port`. Port 0 picks a free port; see `local_port()`.
    pub async fn bind(
        host: &str,
        port: u16,
        sinks: Vec<Arc<dyn LogSink>>,
    ) -> Result<Listener, BindError> {
        let addr = format!("{host}:{port}");
        let sinks = LogSinks::with(sinks);
        let bound = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        match bound {
            Ok((listener, local)) => {
                sinks.emit(&format!("Listening on port {}", local.port()));
                let (closed, _) = watch::channel(false);
                Ok(Listener {
                    local,
                    inner: Mutex::new(Some(listener)),
                    closed,
                    sinks,
                })
            }
            Err(source) => {
                sinks.emit(&format!("Failed to listen on {addr}"));
                Err(BindError { addr, source })
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    pub fn add_log_sink(&self, sink: Arc<dyn LogSink>) {
        self.sinks.add(sink);
    }

    pub fn remove_log_sink(&self, sink: &Arc<dyn LogSink>) -> bool {
        self.sinks.remove(sink)
    }

    /// Wait for one inbound stream. The new `Connection` starts with this listener's sinks.
    pub async fn accept(&self) -> Result<Connection, AcceptError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(AcceptError::Closed);
        }
        let mut guard = tokio::select! {
            guard = self.inner.lock() => guard,
            _ = closed.wait_for(|c| *c) => return Err(AcceptError::Closed),
        };
        let Some(listener) = guard.as_ref() else {
            return Err(AcceptError::Closed);
        };
        let accepted = tokio::select! {
            r = listener.accept() => Some(r),
            _ = closed.wait_for(|c| *c) => None,
        };
        let Some(accepted) = accepted else {
            // close() could not take the socket while we held it.
            guard.take();
            return Err(AcceptError::Closed);
        };
        drop(guard);

        let wrapped = accepted
            .and_then(|(stream, _)| Connection::from_stream(stream, self.sinks.snapshot()));
        match wrapped {
            Ok(conn) => {
                self.sinks.emit(&format!(
                    "Opened connection to {} on port {}",
                    conn.remote_addr(),
                    self.local.port()
                ));
                Ok(conn)
            }
            Err(e) => {
                self.sinks.emit(&format!(
                    "Failed to accept connection on port {}: {e}",
                    self.local.port()
                ));
                Err(AcceptError::Io(e))
            }
        }
    }

    /// Release the port. A task blocked in `accept()` wakes with `AcceptError::Closed`.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.take();
        }
        self.sinks.emit(&format!("Closed listener on port {}", self.local.port()));
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
