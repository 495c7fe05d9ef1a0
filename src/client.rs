//! Public client facade.
//!
//! A [`Client`] owns one connection to the service. Connection upkeep
//! runs in a spawned driver task; the facade methods here are thin
//! operations over the shared state and the event bus, so they can be
//! called from any task.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::TxFrame;
use crate::conn::{run_driver, ClientShared, ConnectionState, DriverCtx};
use crate::constants::{fcchan, to_room_id, to_user_id, FcType, ALT_SITE_HOST, SITE_HOST};
use crate::dispatch::Dispatcher;
use crate::emote::{EmoteEncoder, PlainEmoteEncoder};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::http::{HttpFetcher, ReqwestFetcher};
use crate::registry::ModelRegistry;
use crate::state::SessionState;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Text dialect over WebSockets (default) or the binary socket
    /// dialect.
    pub use_websockets: bool,
    /// Use the alternate site: different host and login user prefix.
    pub alt_site: bool,
    /// Skip the server-config fetch and dial the baked-in server list.
    pub use_cached_server_config: bool,
    /// Force a reconnect when no packet at all arrives for this long.
    pub silence_timeout: Duration,
    /// Stricter threshold for state-carrying packets, applied only when
    /// logged in.
    pub state_silence_timeout: Duration,
    /// Deadline for the server's LOGIN response.
    pub login_timeout: Duration,
    /// Optional overall deadline for [`Client::connect`].
    pub connection_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            use_websockets: true,
            alt_site: false,
            use_cached_server_config: false,
            silence_timeout: Duration::from_millis(90_000),
            state_silence_timeout: Duration::from_millis(120_000),
            login_timeout: Duration::from_millis(30_000),
            connection_timeout: None,
        }
    }
}

/// A user argument: by name or by id.
#[derive(Debug, Clone, PartialEq)]
pub enum UserRef {
    Name(String),
    Id(i64),
}

impl From<&str> for UserRef {
    fn from(name: &str) -> UserRef {
        UserRef::Name(name.to_string())
    }
}

impl From<String> for UserRef {
    fn from(name: String) -> UserRef {
        UserRef::Name(name)
    }
}

impl From<i64> for UserRef {
    fn from(id: i64) -> UserRef {
        UserRef::Id(id)
    }
}

struct DriverHandle {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// One connection to the service.
pub struct Client {
    opts: ClientOptions,
    registry: ModelRegistry,
    bus: Arc<EventBus>,
    shared: Arc<ClientShared>,
    http: Arc<dyn HttpFetcher>,
    emotes: Arc<dyn EmoteEncoder>,
    driver: Mutex<Option<DriverHandle>>,
}

impl Client {
    /// Client with default options and its own registry. Use `"guest"` /
    /// `"guest"` for an anonymous session.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Client {
        Client::with_options(username, password, ClientOptions::default())
    }

    pub fn with_options(
        username: impl Into<String>,
        password: impl Into<String>,
        opts: ClientOptions,
    ) -> Client {
        Client::with_registry(username, password, opts, ModelRegistry::new())
    }

    /// Client sharing an application-owned registry with other clients.
    pub fn with_registry(
        username: impl Into<String>,
        password: impl Into<String>,
        opts: ClientOptions,
        registry: ModelRegistry,
    ) -> Client {
        Client {
            opts,
            registry,
            bus: Arc::new(EventBus::new()),
            shared: ClientShared::new(username.into(), password.into()),
            http: Arc::new(ReqwestFetcher::new()),
            emotes: Arc::new(PlainEmoteEncoder),
            driver: Mutex::new(None),
        }
    }

    /// Replace the HTTP fetcher (server config and EXTDATA indirection).
    pub fn http_fetcher(mut self, http: Arc<dyn HttpFetcher>) -> Client {
        self.http = http;
        self
    }

    /// Replace the outbound emote encoder.
    pub fn emote_encoder(mut self, emotes: Arc<dyn EmoteEncoder>) -> Client {
        self.emotes = emotes;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Callback-level event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Broadcast subscription delivering every client event.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.bus.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Session id assigned at login; 0 before then.
    pub fn session_id(&self) -> i32 {
        self.shared.session_id.load(Ordering::SeqCst)
    }

    /// Our own user id, once logged in.
    pub fn uid(&self) -> Option<i64> {
        match self.shared.uid.load(Ordering::SeqCst) {
            0 => None,
            uid => Some(uid),
        }
    }

    pub fn username(&self) -> String {
        self.shared.username.lock().expect("username lock").clone()
    }

    /// Connect and resolve once the connection is active.
    ///
    /// Rejects on [`Client::disconnect`], on a rejected login, or when
    /// `connection_timeout` elapses. With `do_login` off the connection
    /// stays anonymous and receives only public traffic.
    pub async fn connect(&self, do_login: bool) -> Result<()> {
        if self.state() == ConnectionState::Active {
            return Ok(());
        }
        self.shared.manual.store(false, Ordering::SeqCst);
        let _ = self.shared.take_error();
        self.ensure_driver(do_login);

        let mut states = self.shared.watch_state();
        let wait = async {
            loop {
                match *states.borrow_and_update() {
                    ConnectionState::Active => return Ok(()),
                    ConnectionState::Idle => {
                        if let Some(error) = self.shared.take_error() {
                            return Err(error);
                        }
                        if self.shared.manual.load(Ordering::SeqCst) {
                            return Err(ClientError::Disconnected);
                        }
                    }
                    ConnectionState::Pending => {}
                }
                if states.changed().await.is_err() {
                    return Err(ClientError::Disconnected);
                }
            }
        };

        match self.opts.connection_timeout {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .map_err(|_| ClientError::timeout("connect", deadline))?,
            None => wait.await,
        }
    }

    /// Connect with login and resolve once the initial model and tag
    /// lists have both arrived.
    pub async fn connect_and_wait_for_models(&self) -> Result<()> {
        let mut events = self.events();
        self.connect(true).await?;
        if self.shared.models_loaded.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(ClientEvent::ModelsLoaded) => return Ok(()),
                Ok(ClientEvent::ManualDisconnect) => return Err(ClientError::Disconnected),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.shared.models_loaded.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Disconnected),
            }
        }
    }

    /// Tear the connection down and stay down: cancels the driver along
    /// with its reconnect and keepalive timers, and wakes every pending
    /// wait with a disconnect error.
    pub async fn disconnect(&self) {
        self.shared.manual.store(true, Ordering::SeqCst);
        let taken = self.driver.lock().expect("driver lock").take();
        if let Some(DriverHandle { handle, cancel }) = taken {
            cancel.cancel();
            let _ = handle.await;
        }
        self.shared.set_state(ConnectionState::Idle);
        self.bus.emit_lifecycle(ClientEvent::ManualDisconnect);
        debug!("client disconnected");
    }

    /// Resolve when the connection is active.
    ///
    /// Resolves immediately when already active; rejects immediately
    /// when idle, or when `timeout` is `Some(Duration::ZERO)` (the
    /// "don't wait" sentinel); otherwise waits for the next connect,
    /// bounded by `timeout` when given.
    pub async fn ensure_connected(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = self.events();
        match self.state() {
            ConnectionState::Active => return Ok(()),
            ConnectionState::Idle => return Err(ClientError::NotConnected),
            ConnectionState::Pending => {}
        }
        if timeout == Some(Duration::ZERO) {
            return Err(ClientError::NotConnected);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Connected) => return Ok(()),
                    Ok(ClientEvent::ManualDisconnect) => return Err(ClientError::Disconnected),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.state() == ConnectionState::Active {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::Disconnected)
                    }
                }
            }
        };
        match timeout {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .map_err(|_| ClientError::timeout("ensure_connected", deadline))?,
            None => wait.await,
        }
    }

    /// Join a model's public room. Resolves on the first chat line or
    /// join confirmation for that room; rejects when the server kicks or
    /// bans us out of it.
    pub async fn join_room(&self, id: i64) -> Result<()> {
        let uid = to_user_id(id);
        let mut events = self.events();
        self.tx_cmd(
            FcType::JoinChan,
            to_room_id(id, self.opts.alt_site) as i32,
            0,
            fcchan::JOIN,
            None,
        )?;

        loop {
            match events.recv().await {
                Ok(ClientEvent::Packet(packet)) => {
                    if packet.about_model_uid() != Some(uid) {
                        continue;
                    }
                    match packet.fc_type {
                        FcType::CMesg => return Ok(()),
                        FcType::JoinChan if packet.n_arg2 == fcchan::JOIN => return Ok(()),
                        FcType::JoinChan if packet.n_arg2 == fcchan::PART => {
                            return Err(ClientError::join_refused(uid, "removed from channel"));
                        }
                        FcType::ZBan | FcType::BanChan => {
                            return Err(ClientError::join_refused(uid, "banned from channel"));
                        }
                        _ => {}
                    }
                }
                Ok(ClientEvent::ManualDisconnect) => return Err(ClientError::Disconnected),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Disconnected),
            }
        }
    }

    /// Leave a model's public room. A no-op when not connected.
    pub async fn leave_room(&self, id: i64) -> Result<()> {
        if self.state() != ConnectionState::Active {
            return Ok(());
        }
        self.tx_cmd(
            FcType::JoinChan,
            to_room_id(id, self.opts.alt_site) as i32,
            0,
            fcchan::PART,
            None,
        )
    }

    /// Send a chat line to a model's public room.
    pub async fn send_chat(&self, id: i64, message: &str) -> Result<()> {
        let encoded = self.emotes.encode(message).await?;
        self.tx_cmd(
            FcType::CMesg,
            to_room_id(id, self.opts.alt_site) as i32,
            0,
            0,
            Some(encoded),
        )
    }

    /// Send a private message to a user.
    pub async fn send_pm(&self, id: i64, message: &str) -> Result<()> {
        let encoded = self.emotes.encode(message).await?;
        self.tx_cmd(FcType::PMesg, to_user_id(id) as i32, 0, 0, Some(encoded))
    }

    /// Look a user up by name or id. Resolves with the user's session
    /// snapshot, or `None` when the server reports no such user.
    pub async fn query_user(&self, user: impl Into<UserRef>) -> Result<Option<SessionState>> {
        let query_id = self.shared.next_query_id();
        let payload = match user.into() {
            UserRef::Name(name) => name,
            UserRef::Id(id) => id.to_string(),
        };
        let mut events = self.events();
        self.tx_cmd(FcType::UsernameLookup, 0, query_id, 0, Some(payload))?;

        loop {
            match events.recv().await {
                Ok(ClientEvent::Packet(packet)) => {
                    if packet.fc_type == FcType::UsernameLookup && packet.n_arg1 == query_id {
                        // A bare-string payload is the server's "no such
                        // user" answer.
                        return Ok(packet.payload_state());
                    }
                }
                Ok(ClientEvent::ManualDisconnect) => return Err(ClientError::Disconnected),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Disconnected),
            }
        }
    }

    /// Send a raw command on the current connection. Fails when not
    /// connected; delivery is best-effort beyond that.
    pub fn tx_cmd(
        &self,
        fc_type: FcType,
        n_to: i32,
        n_arg1: i32,
        n_arg2: i32,
        message: Option<String>,
    ) -> Result<()> {
        if self.state() != ConnectionState::Active {
            return Err(ClientError::NotConnected);
        }
        let mut frame = TxFrame::new(fc_type, n_to, n_arg1, n_arg2);
        frame.payload = message;
        self.shared.send(frame)
    }

    fn ensure_driver(&self, do_login: bool) {
        let mut slot = self.driver.lock().expect("driver lock");
        if let Some(existing) = slot.as_ref() {
            if !existing.handle.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let host = if self.opts.alt_site { ALT_SITE_HOST } else { SITE_HOST };
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.shared),
            Arc::clone(&self.http),
            host,
        );
        let ctx = DriverCtx {
            shared: Arc::clone(&self.shared),
            bus: Arc::clone(&self.bus),
            registry: self.registry.clone(),
            http: Arc::clone(&self.http),
            dispatcher,
            opts: self.opts.clone(),
            cancel: cancel.clone(),
            do_login,
        };
        let handle = tokio::spawn(run_driver(ctx));
        *slot = Some(DriverHandle { handle, cancel });
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Cancel the driver on drop for clean shutdown.
        if let Some(existing) = self.driver.lock().expect("driver lock").take() {
            existing.cancel.cancel();
        }
    }
}
