//! Connection lifecycle.
//!
//! A spawned driver task owns the transport for as long as the client
//! wants to stay connected: it fetches the server configuration, dials,
//! performs the hello/login handshake, pumps inbound packets into the
//! dispatcher, enforces the silence and login watchdogs, and reconnects
//! with capped exponential backoff until a manual disconnect.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientOptions;
use crate::codec::TxFrame;
use crate::constants::{
    FcType, ServerConfig, ALT_SITE_HOST, ALT_SITE_USER_PREFIX, BINARY_PORT,
    LOGIN_VERSION_BINARY, LOGIN_VERSION_WEBSOCKET, SITE_HOST, WEBSOCKET_PATH,
};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::http::HttpFetcher;
use crate::registry::ModelRegistry;
use crate::transport::{connect_binary, connect_websocket, TransportPair};

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Idle,
    /// Dialing, handshaking, or waiting out a reconnect delay.
    Pending,
    /// Connected; packets are flowing.
    Active,
}

pub(crate) const BACKOFF_BASE_SECS: f64 = 5.0;
pub(crate) const BACKOFF_MULTIPLIER: f64 = 1.5;
pub(crate) const BACKOFF_CAP_SECS: f64 = 2400.0;

/// Reconnect delay schedule: base, then ×1.5 per consecutive failure,
/// capped. Reset on every successful transition to Active.
#[derive(Debug)]
pub(crate) struct Backoff {
    current: f64,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff { current: BACKOFF_BASE_SECS }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * BACKOFF_MULTIPLIER).min(BACKOFF_CAP_SECS);
        Duration::from_secs_f64(delay)
    }

    pub(crate) fn reset(&mut self) {
        self.current = BACKOFF_BASE_SECS;
    }

    #[cfg(test)]
    pub(crate) fn current_secs(&self) -> f64 {
        self.current
    }
}

/// State shared between the facade, the driver task and the dispatcher.
pub(crate) struct ClientShared {
    state_tx: watch::Sender<ConnectionState>,
    pub(crate) session_id: AtomicI32,
    pub(crate) uid: AtomicI64,
    pub(crate) username: Mutex<String>,
    pub(crate) password: String,
    /// Set by `disconnect()`; suppresses reconnect.
    pub(crate) manual: AtomicBool,
    pub(crate) logged_in: AtomicBool,
    /// Whether this client currently holds a registry login refcount.
    pub(crate) counted_login: AtomicBool,
    pub(crate) completed_models: AtomicBool,
    pub(crate) completed_tags: AtomicBool,
    pub(crate) models_loaded: AtomicBool,
    query_id: AtomicI32,
    tx: Mutex<Option<mpsc::UnboundedSender<TxFrame>>>,
    last_packet: Mutex<Instant>,
    last_state_packet: Mutex<Instant>,
    last_error: Mutex<Option<ClientError>>,
}

impl ClientShared {
    pub(crate) fn new(username: String, password: String) -> Arc<ClientShared> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Arc::new(ClientShared {
            state_tx,
            session_id: AtomicI32::new(0),
            uid: AtomicI64::new(0),
            username: Mutex::new(username),
            password,
            manual: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            counted_login: AtomicBool::new(false),
            completed_models: AtomicBool::new(false),
            completed_tags: AtomicBool::new(false),
            models_loaded: AtomicBool::new(false),
            query_id: AtomicI32::new(20),
            tx: Mutex::new(None),
            last_packet: Mutex::new(Instant::now()),
            last_state_packet: Mutex::new(Instant::now()),
            last_error: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Queue an outbound command onto the live connection's writer,
    /// stamping in the session id.
    pub(crate) fn send(&self, mut frame: TxFrame) -> Result<()> {
        frame.n_from = self.session_id.load(Ordering::SeqCst);
        let tx = self.tx.lock().expect("tx lock");
        let sender = tx.as_ref().ok_or(ClientError::NotConnected)?;
        sender.send(frame).map_err(|_| ClientError::NotConnected)
    }

    pub(crate) fn install_tx(&self, sender: mpsc::UnboundedSender<TxFrame>) {
        *self.tx.lock().expect("tx lock") = Some(sender);
    }

    pub(crate) fn clear_tx(&self) {
        *self.tx.lock().expect("tx lock") = None;
    }

    /// Monotonic query id for USERNAMELOOKUP correlation; starts at 20
    /// to stay clear of codes the server uses itself.
    pub(crate) fn next_query_id(&self) -> i32 {
        self.query_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn touch_packet(&self) {
        *self.last_packet.lock().expect("timestamp lock") = Instant::now();
    }

    pub(crate) fn touch_state_packet(&self) {
        *self.last_state_packet.lock().expect("timestamp lock") = Instant::now();
    }

    pub(crate) fn packet_idle(&self) -> Duration {
        self.last_packet.lock().expect("timestamp lock").elapsed()
    }

    pub(crate) fn state_packet_idle(&self) -> Duration {
        self.last_state_packet.lock().expect("timestamp lock").elapsed()
    }

    pub(crate) fn store_error(&self, error: ClientError) {
        *self.last_error.lock().expect("error lock") = Some(error);
    }

    pub(crate) fn take_error(&self) -> Option<ClientError> {
        self.last_error.lock().expect("error lock").take()
    }

    // Fresh connection: the server re-seeds everything.
    fn reset_connection_latches(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
        self.completed_models.store(false, Ordering::SeqCst);
        self.completed_tags.store(false, Ordering::SeqCst);
        self.models_loaded.store(false, Ordering::SeqCst);
        self.touch_packet();
        self.touch_state_packet();
    }
}

pub(crate) struct DriverCtx {
    pub(crate) shared: Arc<ClientShared>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) registry: ModelRegistry,
    pub(crate) http: Arc<dyn HttpFetcher>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) opts: ClientOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) do_login: bool,
}

enum ConnectionEnd {
    /// `disconnect()` was requested; do not reconnect.
    Manual,
    /// The server rejected the login; surfaced to the caller, no retry.
    LoginFailed(i32),
    /// Anything else; reconnect with backoff.
    Retry,
}

/// Driver task: connect, run, reconnect until cancelled.
pub(crate) async fn run_driver(ctx: DriverCtx) {
    let mut backoff = Backoff::new();

    loop {
        ctx.shared.set_state(ConnectionState::Pending);
        let end = run_connection(&ctx, &mut backoff).await;

        match end {
            ConnectionEnd::Manual => break,
            ConnectionEnd::LoginFailed(code) => {
                ctx.shared.store_error(ClientError::LoginRejected { code });
                break;
            }
            ConnectionEnd::Retry => {
                if ctx.shared.manual.load(Ordering::SeqCst) {
                    break;
                }
                ctx.shared.set_state(ConnectionState::Pending);
                let delay = backoff.next_delay();
                info!(?delay, "reconnecting after connection failure");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => break,
                }
            }
        }
    }

    // Driver exit: this client no longer holds a login refcount.
    if ctx.shared.counted_login.swap(false, Ordering::SeqCst) {
        ctx.registry.client_logged_out();
    }
    ctx.shared.set_state(ConnectionState::Idle);
    debug!("connection driver stopped");
}

async fn run_connection(ctx: &DriverCtx, backoff: &mut Backoff) -> ConnectionEnd {
    let shared = &ctx.shared;

    let config = match load_server_config(ctx).await {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "server config fetch failed");
            return ConnectionEnd::Retry;
        }
    };

    let (mut sink, mut source) = match dial(&ctx.opts, &config).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "dial failed");
            return ConnectionEnd::Retry;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<TxFrame>();
    shared.install_tx(tx);
    shared.reset_connection_latches();

    // Writer task: drains queued commands onto the wire until the queue
    // closes or the socket rejects a write.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(error = %e, "send failed");
                break;
            }
        }
    });

    shared.set_state(ConnectionState::Active);
    backoff.reset();
    ctx.bus.emit_lifecycle(ClientEvent::Connected);
    info!(
        websocket = ctx.opts.use_websockets,
        login = ctx.do_login,
        "connection active"
    );

    let mut login_deadline: Option<Instant> = None;
    if ctx.do_login {
        let version = if ctx.opts.use_websockets {
            LOGIN_VERSION_WEBSOCKET
        } else {
            LOGIN_VERSION_BINARY
        };
        let prefix = if ctx.opts.alt_site { ALT_SITE_USER_PREFIX } else { "" };
        let credentials = {
            let username = shared.username.lock().expect("username lock");
            format!("{prefix}{username}:{}", shared.password)
        };
        let login = TxFrame::new(FcType::Login, 0, version, 0).with_payload(credentials);
        if shared.send(login).is_err() {
            return ConnectionEnd::Retry;
        }
        login_deadline = Some(Instant::now() + ctx.opts.login_timeout);
    }

    // The watchdog ticks fast on WebSockets (the server expects chatter)
    // and slowly on the binary dialect.
    let tick = if ctx.opts.use_websockets {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(120)
    };
    let mut watchdog = tokio::time::interval_at(Instant::now() + tick, tick);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break ConnectionEnd::Manual,

            _ = &mut writer => {
                info!("writer task ended, dropping connection");
                break ConnectionEnd::Retry;
            }

            inbound = source.next_packet() => match inbound {
                Ok(Some(packet)) => {
                    if packet.fc_type == FcType::Login {
                        login_deadline = None;
                    }
                    match ctx.dispatcher.dispatch(packet).await {
                        DispatchOutcome::Continue => {}
                        DispatchOutcome::LoginFailed(code) => {
                            break ConnectionEnd::LoginFailed(code);
                        }
                    }
                }
                Ok(None) => {
                    info!("connection closed by server");
                    break ConnectionEnd::Retry;
                }
                Err(e) => {
                    warn!(error = %e, "connection failed");
                    break ConnectionEnd::Retry;
                }
            },

            _ = watchdog.tick() => {
                if shared.packet_idle() > ctx.opts.silence_timeout {
                    warn!(idle = ?shared.packet_idle(), "silence watchdog tripped");
                    break ConnectionEnd::Retry;
                }
                if shared.logged_in.load(Ordering::SeqCst)
                    && shared.state_packet_idle() > ctx.opts.state_silence_timeout
                {
                    warn!(idle = ?shared.state_packet_idle(), "state silence watchdog tripped");
                    break ConnectionEnd::Retry;
                }
                // No-op keepalive.
                let _ = shared.send(TxFrame::new(FcType::Null, 0, 0, 0));
            }

            _ = tokio::time::sleep_until(
                login_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
            ), if login_deadline.is_some() => {
                warn!("login response deadline passed");
                break ConnectionEnd::Retry;
            }
        }
    };

    shared.clear_tx();
    writer.abort();
    shared.logged_in.store(false, Ordering::SeqCst);
    recycle_guest_name(shared);
    ctx.bus.emit_lifecycle(ClientEvent::Disconnected);
    end
}

// Server-assigned guest names are only valid within their connection;
// logging in again with one is rejected.
fn recycle_guest_name(shared: &ClientShared) {
    if shared.password == "guest" {
        let mut username = shared.username.lock().expect("username lock");
        if username.starts_with("Guest") {
            debug!(%username, "recycling server-assigned guest name");
            *username = "guest".to_string();
        }
    }
}

async fn load_server_config(ctx: &DriverCtx) -> Result<ServerConfig> {
    if ctx.opts.use_cached_server_config {
        return Ok(ServerConfig::cached());
    }
    let host = site_host(&ctx.opts);
    let nc: u32 = rand::thread_rng().gen();
    let url = format!("https://www.{host}/_js/serverconfig.js?nc={nc}");
    let body = ctx.http.get(&url).await?;
    serde_json::from_str(&body)
        .map_err(|e| ClientError::server_config(format!("bad config document: {e}")))
}

async fn dial(opts: &ClientOptions, config: &ServerConfig) -> Result<TransportPair> {
    let host = site_host(opts);
    if opts.use_websockets {
        let names: Vec<&String> = config.websocket_servers.keys().collect();
        if names.is_empty() {
            return Err(ClientError::server_config("no websocket servers listed"));
        }
        let name = names[rand::thread_rng().gen_range(0..names.len())];
        let url = format!("wss://{name}.{host}{WEBSOCKET_PATH}");
        connect_websocket(&url).await
    } else {
        if config.chat_servers.is_empty() {
            return Err(ClientError::server_config("no chat servers listed"));
        }
        let index = rand::thread_rng().gen_range(0..config.chat_servers.len());
        let server = &config.chat_servers[index];
        let addr = format!("{server}.{host}:{BINARY_PORT}");
        connect_binary(&addr).await
    }
}

fn site_host(opts: &ClientOptions) -> &'static str {
    if opts.alt_site {
        ALT_SITE_HOST
    } else {
        SITE_HOST
    }
}
