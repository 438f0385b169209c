//! Device actor: the shared shape of sensors and meters.
//!
//! A running device has an accept loop (one task per inbound connection:
//! handshake, then monitor) and a periodic loop that sends to every peer in
//! the registry and prunes the ones that fail. All tasks are tracked in a
//! `JoinSet` so `shutdown()` can join them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use iot_core::protocol::{self, Message};
use iot_core::reading::{ReadingKind, ReadingSource, SineReading};
use iot_core::{timestamp, wire, BufferedLog, LogSink, ReadingLog};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectError, SendError};
use crate::listener::{AcceptError, BindError, Listener};
use crate::registry::PeerRegistry;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sensor,
    Meter,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sensor => "sensor",
            Role::Meter => "meter",
        }
    }

    /// Handshake this role sends when it dials a peer.
    pub fn announce(self) -> Message {
        match self {
            Role::Sensor => Message::AddSensor,
            Role::Meter => Message::AddMeter,
        }
    }

    /// Whether `msg` is the handshake this role answers with a dial-back.
    pub fn accepts(self, msg: &Message) -> bool {
        matches!(
            (self, msg),
            (Role::Sensor, Message::AddMeter) | (Role::Meter, Message::AddSensor)
        )
    }

    pub fn default_inbound_port(self) -> u16 {
        match self {
            Role::Sensor => 5005,
            Role::Meter => 5006,
        }
    }

    /// The other role's inbound port.
    pub fn default_outbound_port(self) -> u16 {
        match self {
            Role::Sensor => 5006,
            Role::Meter => 5005,
        }
    }

    /// Sensors report every 5 s; meters ping and flush every 30 s.
    pub fn default_interval(self) -> Duration {
        match self {
            Role::Sensor => Duration::from_secs(5),
            Role::Meter => Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub role: Role,
    pub bind_addr: String,
    pub inbound_port: u16,
    /// Port the peers listen on; used for startup dials and dial-backs.
    pub outbound_port: u16,
    pub interval: Duration,
    /// Hosts dialed at startup. Any failure aborts startup.
    pub peers: Vec<String>,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            bind_addr: "0.0.0.0".to_owned(),
            inbound_port: role.default_inbound_port(),
            outbound_port: role.default_outbound_port(),
            interval: role.default_interval(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("failed to send handshake to {peer}: {source}")]
    Handshake { peer: String, source: SendError },
    #[error("periodic interval must be non-zero")]
    ZeroInterval,
}

/// Outcome of one periodic cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sent: usize,
    /// Send failed and close succeeded; removed from the registry.
    pub pruned: usize,
    /// Send failed and close failed too; still registered.
    pub retained: usize,
}

/// A configured, not yet started device.
pub struct Device {
    config: DeviceConfig,
    readings: Arc<dyn ReadingSource>,
    reading_log: Option<Arc<dyn ReadingLog>>,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            readings: Arc::new(SineReading::default()),
            reading_log: None,
            sinks: Vec::new(),
        }
    }

    pub fn with_readings(mut self, readings: Arc<dyn ReadingSource>) -> Self {
        self.readings = readings;
        self
    }

    /// Where received reports go. Without one, reports are only logged.
    pub fn with_reading_log(mut self, log: Arc<dyn ReadingLog>) -> Self {
        self.reading_log = Some(log);
        self
    }

    /// Extra sink for network events, next to the device's own buffered log.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Bind the inbound port, dial the configured peers, then spawn the accept and periodic loops.
    pub async fn start(self) -> Result<RunningDevice, StartError> {
        let Device {
            config,
            readings,
            reading_log,
            sinks: extra_sinks,
        } = self;
        if config.interval.is_zero() {
            return Err(StartError::ZeroInterval);
        }
        let network_log = Arc::new(BufferedLog::timestamped());
        let mut sinks: Vec<Arc<dyn LogSink>> = vec![network_log.clone() as Arc<dyn LogSink>];
        sinks.extend(extra_sinks);

        let listener = Listener::bind(&config.bind_addr, config.inbound_port, sinks.clone()).await?;

        let mut dialed = Vec::with_capacity(config.peers.len());
        for host in &config.peers {
            match dial(host, config.outbound_port, &config.role.announce(), &sinks).await {
                Ok(conn) => dialed.push(conn),
                Err(e) => {
                    error!(device = %config.name, peer = %host, error = %e, "startup dial failed");
                    for conn in dialed {
                        let _ = conn.close().await;
                    }
                    listener.close();
                    return Err(e);
                }
            }
        }

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            role: config.role,
            outbound_port: config.outbound_port,
            peers: PeerRegistry::new(),
            inbound: PeerRegistry::new(),
            readings,
            reading_log,
            network_log,
            sinks,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        });
        let listener = Arc::new(listener);

        for conn in dialed {
            shared.register(Arc::new(conn)).await;
        }
        {
            let shared_accept = shared.clone();
            let listener = listener.clone();
            shared
                .spawn(async move { shared_accept.accept_loop(listener).await })
                .await;
        }
        {
            let shared_tick = shared.clone();
            let interval = config.interval;
            shared
                .spawn(async move { shared_tick.periodic_loop(interval).await })
                .await;
        }

        info!(
            device = %shared.name,
            role = shared.role.as_str(),
            port = listener.local_port(),
            "{} {} started",
            shared.role.as_str(),
            shared.name
        );
        Ok(RunningDevice { shared, listener })
    }
}

async fn dial(
    host: &str,
    port: u16,
    handshake: &Message,
    sinks: &[Arc<dyn LogSink>],
) -> Result<Connection, StartError> {
    let conn = Connection::connect(host, port, sinks.to_vec()).await?;
    if let Err(source) = conn.send(&handshake.to_tokens()).await {
        let _ = conn.close().await;
        return Err(StartError::Handshake {
            peer: format!("{host}:{port}"),
            source,
        });
    }
    Ok(conn)
}

/// Handle to a started device.
pub struct RunningDevice {
    shared: Arc<Shared>,
    listener: Arc<Listener>,
}

impl RunningDevice {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Actual inbound port (differs from the configured one when that was 0).
    pub fn local_port(&self) -> u16 {
        self.listener.local_port()
    }

    /// Outbound connections the periodic loop sends to.
    pub fn peers(&self) -> &PeerRegistry {
        &self.shared.peers
    }

    /// Inbound connections currently being monitored.
    pub fn inbound(&self) -> &PeerRegistry {
        &self.shared.inbound
    }

    /// Device network log; drained after every periodic cycle.
    pub fn network_log(&self) -> &Arc<BufferedLog> {
        &self.shared.network_log
    }

    /// Run one periodic cycle now, outside the timer.
    pub async fn run_cycle(&self) -> CycleReport {
        self.shared.run_cycle().await
    }

    /// Stop both loops, close every connection, join all tasks, and flush logs.
    pub async fn shutdown(self) {
        let shared = self.shared;
        shared.shutdown.send_replace(true);
        self.listener.close();
        let mut open = shared.peers.drain().await;
        open.extend(shared.inbound.drain().await);
        for conn in open {
            if let Err(e) = conn.close().await {
                warn!(device = %shared.name, error = %e, "close during shutdown failed");
            }
        }
        shared.join_all().await;
        shared.flush_logs();
        info!(device = %shared.name, "stopped");
    }
}

struct Shared {
    name: String,
    role: Role,
    outbound_port: u16,
    peers: PeerRegistry,
    inbound: PeerRegistry,
    readings: Arc<dyn ReadingSource>,
    reading_log: Option<Arc<dyn ReadingLog>>,
    network_log: Arc<BufferedLog>,
    sinks: Vec<Arc<dyn LogSink>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Join every tracked task, including ones spawned while joining.
    async fn join_all(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.tasks.lock().await);
            if set.is_empty() {
                break;
            }
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(device = %self.name, "device task panicked");
                    }
                }
            }
        }
    }

    /// Device-level line to the same sinks the connections write to.
    fn note(&self, message: &str) {
        for sink in &self.sinks {
            sink.log(message);
        }
    }

    /// Insert into `registry` unless shutdown has begun, in which case close instead.
    async fn track(&self, registry: &PeerRegistry, conn: &Arc<Connection>) -> bool {
        registry.insert(conn.clone()).await;
        if self.is_shutting_down() {
            registry.remove(&conn.id()).await;
            let _ = conn.close().await;
            return false;
        }
        true
    }

    /// Add an outbound connection to the peer registry and monitor it for hangups.
    async fn register(self: &Arc<Self>, conn: Arc<Connection>) {
        if !self.track(&self.peers, &conn).await {
            return;
        }
        info!(device = %self.name, peer = %conn.remote_addr(), "peer registered");
        let shared = self.clone();
        self.spawn(async move { shared.monitor(conn, None).await })
            .await;
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<Listener>) {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let shared = self.clone();
                    self.spawn(async move { shared.handle_inbound(Arc::new(conn)).await })
                        .await;
                }
                Err(AcceptError::Closed) => break,
                Err(AcceptError::Io(e)) => {
                    warn!(device = %self.name, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!(device = %self.name, "accept loop ended");
    }

    /// Read the handshake from a fresh inbound connection, act on it, then monitor the connection.
    async fn handle_inbound(self: Arc<Self>, conn: Arc<Connection>) {
        if !self.track(&self.inbound, &conn).await {
            return;
        }
        let mut peer_name = None;
        match conn.receive().await {
            Ok(tokens) => {
                let msg = Message::from_tokens(&tokens);
                if self.role.accepts(&msg) {
                    self.dial_back(&conn).await;
                } else if let Message::Ack { from } = msg {
                    info!(device = %self.name, peer = %from, "handshake acknowledged");
                    peer_name = Some(from);
                } else {
                    self.note(&format!(
                        "Ignored handshake {} from {}",
                        wire::encode(&tokens),
                        conn.remote_addr()
                    ));
                    debug!(
                        device = %self.name,
                        peer = %conn.remote_addr(),
                        "unrecognized handshake"
                    );
                }
            }
            Err(e) if e.is_terminal() => {
                self.drop_connection(&conn, None).await;
                return;
            }
            Err(e) => debug!(device = %self.name, error = %e, "unreadable handshake"),
        }
        self.monitor(conn, peer_name).await;
    }

    /// Answer a handshake: dial the peer on its well-known port, ack, register.
    async fn dial_back(self: &Arc<Self>, inbound: &Connection) {
        let host = inbound.remote_addr().ip().to_string();
        let conn = match Connection::connect(&host, self.outbound_port, self.sinks.clone()).await {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(device = %self.name, error = %e, "dial-back failed");
                return;
            }
        };
        let ack = Message::Ack {
            from: self.name.clone(),
        };
        if let Err(e) = conn.send(&ack.to_tokens()).await {
            warn!(device = %self.name, peer = %conn.remote_addr(), error = %e, "ack failed");
            let _ = conn.close().await;
            return;
        }
        self.register(conn).await;
    }

    /// Serve one connection until it yields the terminal signal, then drop it everywhere.
    async fn monitor(&self, conn: Arc<Connection>, mut peer_name: Option<String>) {
        loop {
            match conn.receive().await {
                Ok(tokens) => self.dispatch(&conn, &tokens, &mut peer_name).await,
                Err(e) if e.is_terminal() => break,
                Err(e) => debug!(device = %self.name, error = %e, "skipping undecodable frame"),
            }
        }
        self.drop_connection(&conn, peer_name.as_deref()).await;
    }

    async fn dispatch(&self, conn: &Connection, tokens: &[String], peer_name: &mut Option<String>) {
        match Message::from_tokens(tokens) {
            Message::Report { from, water, power } => {
                match &self.reading_log {
                    Some(log) => {
                        if let Err(e) = log.record(&from, &timestamp::now(), &water, &power) {
                            warn!(
                                device = %self.name,
                                peer = %from,
                                error = %e,
                                "failed to record reading"
                            );
                        }
                    }
                    None => {
                        debug!(device = %self.name, peer = %from, "no reading log; report dropped")
                    }
                }
                peer_name.get_or_insert(from);
            }
            Message::Ping { .. } => {
                let pong = Message::Pong {
                    from: self.name.clone(),
                };
                // A failed reply surfaces as a terminal receive on the next pass.
                let _ = conn.send(&pong.to_tokens()).await;
            }
            Message::Pong { .. } | Message::Ack { .. } => {}
            other => debug!(device = %self.name, message = ?other, "ignoring message"),
        }
    }

    async fn drop_connection(&self, conn: &Connection, peer_name: Option<&str>) {
        self.peers.remove(&conn.id()).await;
        self.inbound.remove(&conn.id()).await;
        if let Err(e) = conn.close().await {
            warn!(device = %self.name, error = %e, "close after hangup failed");
        }
        if let (Some(log), Some(name)) = (&self.reading_log, peer_name) {
            if let Err(e) = log.release(name) {
                warn!(
                    device = %self.name,
                    peer = %name,
                    error = %e,
                    "failed to release reading log"
                );
            }
        }
    }

    async fn periodic_loop(self: Arc<Self>, interval: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            self.run_cycle().await;
        }
        debug!(device = %self.name, "periodic loop ended");
    }

    fn outbound_tokens(&self) -> Vec<String> {
        match self.role {
            Role::Sensor => protocol::report_tokens(
                &self.name,
                self.readings.current_reading(ReadingKind::Water),
                self.readings.current_reading(ReadingKind::Power),
            ),
            Role::Meter => Message::Ping {
                from: self.name.clone(),
            }
            .to_tokens(),
        }
    }

    /// Send to every registered peer. A peer whose send fails is closed and,
    /// if that works, removed.
    async fn run_cycle(&self) -> CycleReport {
        let tokens = self.outbound_tokens();
        let mut report = CycleReport::default();
        for conn in self.peers.snapshot().await {
            if conn.send(&tokens).await.is_ok() {
                report.sent += 1;
                continue;
            }
            match conn.close().await {
                Ok(()) => {
                    self.peers.remove(&conn.id()).await;
                    report.pruned += 1;
                }
                Err(e) => {
                    // Stays registered; the next cycle's send fails on the closed
                    // connection and the no-op close then removes it.
                    warn!(
                        device = %self.name,
                        error = %e,
                        "close after failed send failed; peer kept"
                    );
                    self.note(&format!(
                        "Keeping {} registered after failed close",
                        conn.remote_addr()
                    ));
                    report.retained += 1;
                }
            }
        }
        if report.pruned > 0 || report.retained > 0 {
            debug!(device = %self.name, ?report, "cycle had failures");
        }
        self.flush_logs();
        report
    }

    fn flush_logs(&self) {
        let text = self.network_log.flush();
        for line in text.lines() {
            info!(target: "iot_node::network", device = %self.name, "{line}");
        }
        if let Some(log) = &self.reading_log {
            if let Err(e) = log.flush() {
                warn!(device = %self.name, error = %e, "failed to flush reading logs");
            }
        }
    }
}
