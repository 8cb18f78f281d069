//! Connection worker: owns the transport, logs in, keeps the link alive and
//! reconnects after failures.
//!
//! One serialized event loop consumes transport lifecycle events, outbound
//! frames from the interface worker, and a periodic tick. Every failure is
//! routed through the same reconnect path; there are no ad hoc retries.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::packet::frame::{action, Frame};
use crate::route::PrefixRule;
use crate::transport::{LinkListener, Transport};
use crate::{EVENT_TICK, KEEPALIVE_INTERVAL, WRITE_QUEUE_DEPTH};

/// Connection lifecycle states. `Terminal` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Connecting,
    Connected,
    UnAuthenticated,
    Authenticated,
    Terminal,
    Closed,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Init => "init",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::UnAuthenticated => "unauthenticated",
            ConnState::Authenticated => "authenticated",
            ConnState::Terminal => "terminal",
            ConnState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle events consumed by the event loop.
#[derive(Debug)]
enum ConnEvent {
    /// The transport finished connecting.
    Connected,
    /// The transport was closed.
    Closed,
    /// Some path asked for a reconnect (dead link, read error).
    Reconnect {
        generation: u64,
        reason: &'static str,
    },
}

/// Credentials sent once at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub password: String,
    pub network: String,
    pub uuid: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub version: String,
}

/// One route handed down with a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRoute {
    pub prefix: String,
    pub nexthop: String,
}

/// Address lease received from the switch after login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub address: String,
    pub netmask: String,
    #[serde(default)]
    pub routes: Vec<LeaseRoute>,
}

impl Lease {
    /// Address in `a.b.c.d/len` form, for interface configuration.
    pub fn address_cidr(&self) -> Result<String> {
        Ok(format!("{}/{}", self.address, self.prefix_len()?))
    }

    /// Netmask as a prefix length.
    pub fn prefix_len(&self) -> Result<u8> {
        let mask: std::net::Ipv4Addr = self
            .netmask
            .parse()
            .map_err(|_| Error::protocol(format!("bad netmask {:?}", self.netmask)))?;
        Ok(u32::from(mask).count_ones() as u8)
    }

    /// Routes as prefix rules, preserving order.
    pub fn prefix_rules(&self) -> Result<Vec<PrefixRule>> {
        self.routes
            .iter()
            .map(|route| {
                let (network, len) = route
                    .prefix
                    .split_once('/')
                    .ok_or_else(|| Error::protocol(format!("bad prefix {:?}", route.prefix)))?;
                PrefixRule::new(
                    network
                        .parse()
                        .map_err(|_| Error::protocol(format!("bad network {network:?}")))?,
                    len.parse()
                        .map_err(|_| Error::protocol(format!("bad prefix length {len:?}")))?,
                    route
                        .nexthop
                        .parse()
                        .map_err(|_| Error::protocol(format!("bad nexthop {:?}", route.nexthop)))?,
                )
            })
            .collect()
    }
}

/// Observer for authentication and lease outcomes, set once at wiring time.
pub trait ConnListener: Send + Sync {
    /// Login succeeded.
    fn on_authenticated(&self);
    /// Login was rejected; configured addresses/routes must be torn down.
    fn on_unauthenticated(&self, reason: &str);
    /// A lease arrived and should be applied.
    fn on_lease(&self, lease: &Lease);
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub credential: Credential,
    pub request_addr: bool,
    pub idle_timeout: Duration,
}

/// A deferred one-shot reconnect attempt.
#[derive(Debug, Clone, Copy)]
struct JobTimer {
    fire_at: Instant,
    generation: u64,
}

/// State shared between the event loop, the read loop and the public handle.
struct ConnShared {
    transport: Arc<dyn Transport>,
    cfg: ConnConfig,
    state: Mutex<ConnState>,
    /// Consecutive backoff invocations since the last successful login.
    sleeps: AtomicU32,
    /// Bumped on every successful transport connect; stale jobs and events
    /// compare against it.
    generation: AtomicU64,
    last_read: Mutex<Instant>,
    last_alive: Mutex<Instant>,
    lease: Mutex<Option<Lease>>,
    listener: OnceLock<Arc<dyn ConnListener>>,
    event_tx: mpsc::Sender<ConnEvent>,
    inbound_tx: mpsc::Sender<Frame>,
}

impl ConnShared {
    fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// Transition unless already terminal.
    fn set_state(&self, next: ConnState) {
        let mut state = self.state.lock().unwrap();
        if *state != ConnState::Terminal {
            debug!(from = %*state, to = %next, "connection state");
            *state = next;
        }
    }

    fn is_terminal(&self) -> bool {
        self.state() == ConnState::Terminal
    }

    fn raise_reconnect(&self, generation: u64, reason: &'static str) {
        let _ = self.event_tx.try_send(ConnEvent::Reconnect { generation, reason });
    }

    /// Dead-link detection: outbound traffic is the trigger, so idle but
    /// healthy links are left alone.
    fn idle_exceeded(&self) -> bool {
        self.last_read.lock().unwrap().elapsed() > self.cfg.idle_timeout
    }

    /// Write one frame, checking link liveness first.
    async fn write_wire(&self, bytes: &[u8], generation: u64) -> Result<()> {
        if self.idle_exceeded() {
            self.raise_reconnect(generation, "idle timeout");
            return Err(Error::Timeout);
        }
        self.transport.write_frame(bytes).await
    }

    async fn send_control(&self, frame: Frame, generation: u64) -> Result<()> {
        self.write_wire(frame.as_bytes(), generation).await
    }

    async fn send_login(&self, generation: u64) -> Result<()> {
        let body = serde_json::to_vec(&self.cfg.credential)?;
        info!(user = %self.cfg.credential.name, network = %self.cfg.credential.network, "sending login");
        self.send_control(Frame::request(action::LOGIN, &body)?, generation)
            .await
    }

    async fn send_ipaddr_request(&self, generation: u64) -> Result<()> {
        let body = serde_json::to_vec(&json!({
            "name": self.cfg.credential.name,
            "network": self.cfg.credential.network,
        }))?;
        self.send_control(Frame::request(action::IPADDR, &body)?, generation)
            .await
    }

    async fn send_ping(&self, generation: u64) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let body = serde_json::to_vec(&json!({
            "uuid": self.cfg.credential.uuid,
            "time": now,
        }))?;
        self.send_control(Frame::request(action::PING, &body)?, generation)
            .await
    }

    async fn send_left(&self, generation: u64) -> Result<()> {
        let body = serde_json::to_vec(&json!({
            "name": self.cfg.credential.name,
            "uuid": self.cfg.credential.uuid,
        }))?;
        self.send_control(Frame::request(action::LEFT, &body)?, generation)
            .await
    }

    /// Handle a control frame on the read path. State transitions share the
    /// one state lock with the event loop.
    async fn handle_control(&self, frame: &Frame, generation: u64) {
        match frame.action() {
            Some(action::LOGIN) if frame.is_response() => {
                self.on_login_response(frame, generation).await;
            }
            Some(action::IPADDR) if frame.is_response() => {
                self.on_lease_response(frame);
            }
            Some(action::PONG) => {
                *self.last_alive.lock().unwrap() = Instant::now();
            }
            Some(action::SIGNIN) => {
                info!("switch requested sign-in");
                if let Err(e) = self.send_login(generation).await {
                    warn!(error = %e, "sign-in login failed");
                }
            }
            Some(other) => {
                debug!(action = other, "unhandled control action");
            }
            None => {
                debug!("control frame without action");
            }
        }
    }

    async fn on_login_response(&self, frame: &Frame, generation: u64) {
        let body = String::from_utf8_lossy(frame.body());
        if body.starts_with("okay") {
            info!("login accepted");
            self.sleeps.store(0, Ordering::SeqCst);
            self.set_state(ConnState::Authenticated);
            if let Some(listener) = self.listener.get() {
                listener.on_authenticated();
            }
            if self.cfg.request_addr {
                if let Err(e) = self.send_ipaddr_request(generation).await {
                    warn!(error = %e, "lease request failed");
                }
            }
        } else {
            warn!(reason = %body, "login rejected");
            self.set_state(ConnState::UnAuthenticated);
            if let Some(listener) = self.listener.get() {
                listener.on_unauthenticated(&body);
            }
        }
    }

    fn on_lease_response(&self, frame: &Frame) {
        match serde_json::from_slice::<Lease>(frame.body()) {
            Ok(lease) => {
                info!(address = %lease.address, netmask = %lease.netmask, "lease received");
                *self.lease.lock().unwrap() = Some(lease.clone());
                if let Some(listener) = self.listener.get() {
                    listener.on_lease(&lease);
                }
            }
            Err(e) => {
                warn!(error = %e, "bad lease body");
            }
        }
    }
}

/// Forwards transport lifecycle callbacks into the event queue.
struct EventForwarder {
    event_tx: mpsc::Sender<ConnEvent>,
}

impl LinkListener for EventForwarder {
    fn on_connected(&self) {
        let _ = self.event_tx.try_send(ConnEvent::Connected);
    }

    fn on_closed(&self) {
        let _ = self.event_tx.try_send(ConnEvent::Closed);
    }
}

/// Public handle to the connection worker.
pub struct ConnWorker {
    shared: Arc<ConnShared>,
    done: Arc<Notify>,
    out_tx: mpsc::Sender<Frame>,
    parts: Mutex<Option<LoopParts>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct LoopParts {
    event_rx: mpsc::Receiver<ConnEvent>,
    out_rx: mpsc::Receiver<Frame>,
}

impl ConnWorker {
    /// Build a worker around a transport. `inbound_tx` receives Ethernet
    /// frames from the switch for the interface worker.
    pub fn new(
        transport: Arc<dyn Transport>,
        cfg: ConnConfig,
        inbound_tx: mpsc::Sender<Frame>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        transport.set_listener(Arc::new(EventForwarder {
            event_tx: event_tx.clone(),
        }));

        let shared = Arc::new(ConnShared {
            transport,
            cfg,
            state: Mutex::new(ConnState::Init),
            sleeps: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            last_read: Mutex::new(Instant::now()),
            last_alive: Mutex::new(Instant::now()),
            lease: Mutex::new(None),
            listener: OnceLock::new(),
            event_tx,
            inbound_tx,
        });

        Self {
            shared,
            done: Arc::new(Notify::new()),
            out_tx,
            parts: Mutex::new(Some(LoopParts { event_rx, out_rx })),
            task: Mutex::new(None),
        }
    }

    /// Register the authentication/lease observer. Later calls are ignored.
    pub fn set_listener(&self, listener: Arc<dyn ConnListener>) {
        let _ = self.shared.listener.set(listener);
    }

    /// Sender the interface worker uses to enqueue outbound frames.
    pub fn queue(&self) -> mpsc::Sender<Frame> {
        self.out_tx.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    /// Last lease received, if any.
    pub fn lease(&self) -> Option<Lease> {
        self.shared.lease.lock().unwrap().clone()
    }

    /// Remote switch address, once connected.
    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.shared.transport.remote_addr()
    }

    /// Spawn the event loop and trigger the first connect.
    pub fn start(&self) {
        let Some(parts) = self.parts.lock().unwrap().take() else {
            return;
        };
        let mut event_loop = EventLoop {
            shared: self.shared.clone(),
            done: self.done.clone(),
            event_rx: parts.event_rx,
            out_rx: parts.out_rx,
            timers: Vec::new(),
            read_task: None,
            last_ping: Instant::now(),
        };
        let handle = tokio::spawn(async move { event_loop.run().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the worker: terminal state, graceful leave, transport closed.
    /// Safe to call twice; the second call drops through.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == ConnState::Terminal {
                return;
            }
            *state = ConnState::Terminal;
        }
        self.done.notify_one();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// The single serialized event loop.
struct EventLoop {
    shared: Arc<ConnShared>,
    done: Arc<Notify>,
    event_rx: mpsc::Receiver<ConnEvent>,
    out_rx: mpsc::Receiver<Frame>,
    timers: Vec<JobTimer>,
    read_task: Option<JoinHandle<()>>,
    last_ping: Instant,
}

impl EventLoop {
    async fn run(&mut self) {
        self.try_connect().await;

        let mut tick = tokio::time::interval(EVENT_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.done.notified() => break,

                Some(event) = self.event_rx.recv() => {
                    self.on_event(event).await;
                }

                Some(frame) = self.out_rx.recv() => {
                    self.forward(frame).await;
                }

                _ = tick.tick() => {
                    self.drain_timers().await;
                    self.keepalive().await;
                }
            }
            if self.shared.is_terminal() {
                break;
            }
        }

        // Teardown: pending jobs are discarded, never executed.
        self.abort_read_task();
        self.timers.clear();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        if let Err(e) = self.shared.send_left(generation).await {
            debug!(error = %e, "left notification skipped");
        }
        self.shared.transport.close().await;
        info!("connection worker stopped");
    }

    fn abort_read_task(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }

    async fn on_event(&mut self, event: ConnEvent) {
        if self.shared.is_terminal() {
            return;
        }
        match event {
            ConnEvent::Connected => {
                self.shared.set_state(ConnState::Connected);
                *self.shared.last_read.lock().unwrap() = Instant::now();
                self.spawn_read_loop();
                let generation = self.shared.generation.load(Ordering::SeqCst);
                if let Err(e) = self.shared.send_login(generation).await {
                    warn!(error = %e, "login send failed");
                }
            }
            ConnEvent::Closed => {
                if self.shared.state() == ConnState::Closed {
                    return;
                }
                self.shared.set_state(ConnState::Closed);
                self.abort_read_task();
                self.schedule_reconnect();
            }
            ConnEvent::Reconnect { generation, reason } => {
                if generation < self.shared.generation.load(Ordering::SeqCst) {
                    debug!(reason, "stale reconnect dropped");
                    return;
                }
                if self.shared.state() == ConnState::Closed {
                    return;
                }
                warn!(reason, "closing link for reconnect");
                self.abort_read_task();
                // Closing fires the transport's closed callback, which lands
                // here as ConnEvent::Closed and schedules the backoff.
                self.shared.transport.close().await;
            }
        }
    }

    /// Forward one queued frame towards the switch.
    async fn forward(&mut self, frame: Frame) {
        if self.shared.state() != ConnState::Authenticated {
            debug!("dropping frame, not authenticated");
            return;
        }
        let generation = self.shared.generation.load(Ordering::SeqCst);
        if let Err(e) = self.shared.write_wire(frame.as_bytes(), generation).await {
            debug!(error = %e, "frame write failed");
        }
    }

    /// Emit a ping while authenticated; the pong is informational only.
    async fn keepalive(&mut self) {
        if self.shared.state() != ConnState::Authenticated {
            return;
        }
        if self.last_ping.elapsed() < KEEPALIVE_INTERVAL {
            return;
        }
        self.last_ping = Instant::now();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        if let Err(e) = self.shared.send_ping(generation).await {
            debug!(error = %e, "keepalive failed");
        }
    }

    /// Bounded backoff: the i-th consecutive trigger sleeps
    /// `5 * min(i, 20)` seconds; the counter resets on login success.
    fn schedule_reconnect(&mut self) {
        let sleeps = self.shared.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = Duration::from_secs(5 * u64::from(sleeps.min(20)));
        let generation = self.shared.generation.load(Ordering::SeqCst);
        info!(delay_secs = delay.as_secs(), "reconnect scheduled");
        self.timers.push(JobTimer {
            fire_at: Instant::now() + delay,
            generation,
        });
    }

    async fn drain_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.timers.retain(|job| {
            if job.fire_at <= now {
                due.push(*job);
                false
            } else {
                true
            }
        });
        for job in due {
            // A newer successful connection makes the job a no-op; this
            // guards against a duplicate reconnect racing a fast recovery.
            if job.generation < self.shared.generation.load(Ordering::SeqCst) {
                debug!("stale reconnect job dropped");
                continue;
            }
            self.try_connect().await;
        }
    }

    async fn try_connect(&mut self) {
        if self.shared.is_terminal() {
            return;
        }
        self.abort_read_task();
        self.shared.set_state(ConnState::Connecting);
        match self.shared.transport.connect().await {
            Ok(()) => {
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
                // The transport's connected callback queues the Connected
                // event; login is sent from there.
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.shared.set_state(ConnState::Closed);
                self.schedule_reconnect();
            }
        }
    }

    /// One dedicated task blocks on the transport read primitive. Control
    /// frames are handled in place; Ethernet frames go to the interface
    /// worker. A read error raises one reconnect event and exits.
    fn spawn_read_loop(&mut self) {
        self.abort_read_task();
        let shared = self.shared.clone();
        let generation = shared.generation.load(Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            loop {
                match shared.transport.read_frame().await {
                    Ok(bytes) => {
                        *shared.last_read.lock().unwrap() = Instant::now();
                        match Frame::decode(bytes) {
                            Ok(frame) if frame.is_control() => {
                                shared.handle_control(&frame, generation).await;
                            }
                            Ok(frame) => {
                                if shared.inbound_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "malformed frame");
                                shared.raise_reconnect(generation, "malformed frame");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "read loop ended");
                        shared.raise_reconnect(generation, "read error");
                        break;
                    }
                }
            }
        });
        self.read_task = Some(handle);
    }
}
