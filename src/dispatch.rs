//! Packet dispatch.
//!
//! Every decoded packet passes through here exactly once, in arrival
//! order: watchdog timestamps first, then the per-type side effects
//! against the registry, then event emission (the type-named event
//! followed by the wildcard). Handlers are defensive about payload
//! shapes; a malformed payload is logged and skipped, never fatal.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, trace, warn};

use crate::codec::TxFrame;
use crate::conn::ClientShared;
use crate::constants::{fcchan, fcwopt, to_user_id, FcType, ListKind, UserLevel};
use crate::events::{ClientEvent, EventBus};
use crate::http::HttpFetcher;
use crate::listdata::{decode_list, ListData};
use crate::packet::{Packet, Payload};
use crate::registry::ModelRegistry;
use crate::state::SessionState;

/// What the connection manager should do after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Continue,
    /// The server rejected our login; fatal, no retry.
    LoginFailed(i32),
}

pub(crate) struct Dispatcher {
    registry: ModelRegistry,
    bus: Arc<EventBus>,
    shared: Arc<ClientShared>,
    http: Arc<dyn HttpFetcher>,
    /// Host for EXTDATA indirection fetches.
    host: &'static str,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: ModelRegistry,
        bus: Arc<EventBus>,
        shared: Arc<ClientShared>,
        http: Arc<dyn HttpFetcher>,
        host: &'static str,
    ) -> Dispatcher {
        Dispatcher { registry, bus, shared, http, host }
    }

    /// Apply one packet's side effects and publish its events.
    pub(crate) async fn dispatch(&self, packet: Packet) -> DispatchOutcome {
        let packet = Arc::new(packet);

        self.shared.touch_packet();
        if packet.fc_type.is_state_class() {
            self.shared.touch_state_packet();
        }

        let mut outcome = DispatchOutcome::Continue;
        match packet.fc_type {
            FcType::Login => outcome = self.handle_login(&packet),
            kind if kind.is_state_class() => self.handle_state_update(&packet),
            FcType::Tags => self.handle_tag_map(packet.payload.as_json()),
            FcType::Bookmarks => self.handle_bookmarks(&packet),
            FcType::ExtData => self.handle_extdata(&packet).await,
            FcType::ManageList => self.handle_manage_list(&packet),
            FcType::RoomData => self.handle_room_data(&packet),
            other => trace!(%other, "no side effects for packet type"),
        }

        self.bus.emit_packet(&packet);
        outcome
    }

    // Object-safe recursion point for EXTDATA re-injection.
    fn dispatch_boxed<'a>(
        &'a self,
        packet: Packet,
    ) -> Pin<Box<dyn Future<Output = DispatchOutcome> + Send + 'a>> {
        Box::pin(self.dispatch(packet))
    }

    fn handle_login(&self, packet: &Packet) -> DispatchOutcome {
        if packet.n_arg1 != 0 {
            error!(code = packet.n_arg1, "login rejected by server");
            return DispatchOutcome::LoginFailed(packet.n_arg1);
        }

        self.shared.session_id.store(packet.n_to, Ordering::SeqCst);
        self.shared.uid.store(packet.n_arg2 as i64, Ordering::SeqCst);
        if let Some(name) = packet.payload.as_text() {
            *self.shared.username.lock().expect("username lock") = name;
        }
        self.shared.logged_in.store(true, Ordering::SeqCst);
        if !self.shared.counted_login.swap(true, Ordering::SeqCst) {
            self.registry.client_logged_in();
        }
        info!(
            session_id = packet.n_to,
            uid = packet.n_arg2,
            "login complete"
        );

        // Subscribe to room viewer-count updates right away.
        if let Err(e) = self.shared.send(TxFrame::new(FcType::RoomData, 0, fcchan::JOIN, 0)) {
            warn!(error = %e, "could not subscribe to room data");
        }
        DispatchOutcome::Continue
    }

    // The DETAILS group: any of these may carry a session snapshot worth
    // merging, with three envelope shapes that never do.
    fn handle_state_update(&self, packet: &Packet) {
        match packet.fc_type {
            FcType::Details if packet.n_from == FcType::TokenInc.to_raw() => return,
            FcType::RoomHelper if packet.n_arg2 < 100 => return,
            FcType::JoinChan if packet.n_arg2 == fcchan::PART => return,
            _ => {}
        }

        let Some(state) = packet.payload_state() else {
            return;
        };
        self.merge_candidate(&state, packet.about_model_uid());
    }

    /// Merge a candidate snapshot under the level rules: the model level
    /// auto-creates, an absent level only updates known models (except
    /// that a video state identifies a broadcaster on its own), and a
    /// confirmed non-model level never merges.
    fn merge_candidate(&self, state: &SessionState, fallback_uid: Option<i64>) {
        let uid = match (state.uid(), state.sid()) {
            (Some(0), sid) if sid > 0 => Some(sid),
            (Some(uid), _) if uid > 0 => Some(uid),
            (None, _) => fallback_uid,
            _ => None,
        };
        let Some(uid) = uid.filter(|uid| *uid > 0) else {
            return;
        };

        match state.level() {
            Some(UserLevel::Model) => {
                self.registry.merge(uid, state, true);
            }
            None => {
                let auto_create = state.effective("vs").is_some();
                self.registry.merge(uid, state, auto_create);
            }
            Some(_) => trace!(uid, "skipping state for confirmed non-model"),
        }
    }

    // Bulk-list records auto-create only on an explicit model level;
    // unlike live state updates, a bare video state is not enough.
    fn merge_list_record(&self, state: &SessionState) {
        let uid = match (state.uid(), state.sid()) {
            (Some(0), sid) if sid > 0 => Some(sid),
            (Some(uid), _) if uid > 0 => Some(uid),
            _ => None,
        };
        let Some(uid) = uid else {
            return;
        };
        self.registry
            .merge(uid, state, state.level() == Some(UserLevel::Model));
    }

    // Payload shape: { "<uid>": ["tag", ...], ... }. Tags never create
    // models.
    fn handle_tag_map(&self, payload: Option<&Value>) {
        let Some(map) = payload.and_then(Value::as_object) else {
            return;
        };
        self.apply_tag_map(map);
    }

    fn apply_tag_map(&self, map: &Map<String, Value>) {
        for (uid_text, tags) in map {
            let Ok(uid) = uid_text.parse::<i64>() else {
                debug!(%uid_text, "non-numeric uid key in tag map");
                continue;
            };
            let Some(tags) = tags.as_array() else {
                continue;
            };
            let tags: Vec<String> = tags
                .iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect();
            self.registry.merge_tags(uid, tags);
        }
    }

    fn handle_bookmarks(&self, packet: &Packet) {
        let entries = packet
            .payload
            .as_json()
            .and_then(|v| v.get("bookmarks"))
            .and_then(Value::as_array);
        let Some(entries) = entries else {
            return;
        };
        for entry in entries {
            let Some(state) = SessionState::from_value(entry) else {
                continue;
            };
            let Some(uid) = state.uid().filter(|uid| *uid > 0) else {
                continue;
            };
            // Bookmarks update known models only.
            self.registry.merge(uid, &state, false);
        }
    }

    // EXTDATA with the redis-json option is a pointer: fetch the real
    // payload over HTTPS and re-inject it as the packet described by the
    // carried envelope. Fetch failures are logged and dropped.
    async fn handle_extdata(&self, packet: &Packet) {
        let session_id = self.shared.session_id.load(Ordering::SeqCst);
        if packet.n_to != session_id || packet.n_arg2 != fcwopt::REDIS_JSON {
            return;
        }
        let Some(payload) = packet.payload.as_json() else {
            return;
        };

        let field = |name: &str| payload.get(name).map(query_value);
        let (Some(respkey), Some(kind), Some(opts), Some(serv)) =
            (field("respkey"), field("type"), field("opts"), field("serv"))
        else {
            debug!("EXTDATA payload missing indirection fields");
            return;
        };

        let url = format!(
            "https://www.{}/php/FcwExtResp.php?respkey={respkey}&type={kind}&opts={opts}&serv={serv}",
            self.host
        );
        let body = match self.http.get(&url).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, %respkey, "EXTDATA fetch failed");
                return;
            }
        };

        let Some(envelope) = payload.get("msg") else {
            debug!("EXTDATA payload missing envelope");
            return;
        };
        let env = |name: &str| {
            envelope.get(name).and_then(Value::as_i64).unwrap_or(0) as i32
        };
        let inner = Packet::new(
            FcType::from_raw(env("type")),
            env("from"),
            env("to"),
            env("arg1"),
            env("arg2"),
            body.len(),
            Payload::parse(&body),
        );
        debug!(fc_type = %inner.fc_type, %respkey, "re-injecting EXTDATA payload");
        self.dispatch_boxed(inner).await;
    }

    fn handle_manage_list(&self, packet: &Packet) {
        if packet.n_arg2 <= 0 {
            return;
        }
        let Some(rdata) = packet.payload.as_json().and_then(|v| v.get("rdata")) else {
            return;
        };

        let kind = ListKind::from_raw(packet.n_arg2);
        match kind {
            ListKind::Roommates | ListKind::Cams | ListKind::Friends | ListKind::Ignores => {
                if let ListData::Records(records) = decode_list(rdata) {
                    debug!(?kind, count = records.len(), "applying bulk list");
                    for state in &records {
                        self.merge_list_record(state);
                    }
                }
                if kind == ListKind::Cams {
                    self.shared.completed_models.store(true, Ordering::SeqCst);
                    self.maybe_models_loaded();
                }
            }
            ListKind::Tags => {
                match decode_list(rdata) {
                    ListData::Structured(map) => self.handle_tag_map(Some(&map)),
                    ListData::Records(_) => debug!("unexpected record-form tag list"),
                }
                self.shared.completed_tags.store(true, Ordering::SeqCst);
                self.maybe_models_loaded();
            }
            ListKind::Other(code) => debug!(code, "ignoring unhandled list kind"),
        }
    }

    // Both initial lists are in; fires at most once per connection.
    fn maybe_models_loaded(&self) {
        if self.shared.completed_models.load(Ordering::SeqCst)
            && self.shared.completed_tags.load(Ordering::SeqCst)
            && !self.shared.models_loaded.swap(true, Ordering::SeqCst)
        {
            info!(models = self.registry.len(), "initial model and tag lists loaded");
            self.bus.emit_lifecycle(ClientEvent::ModelsLoaded);
        }
    }

    // Viewer counts arrive either as a flat [uid, count, ...] array or a
    // {"uid": count} map. Unknown models are skipped.
    fn handle_room_data(&self, packet: &Packet) {
        match packet.payload.as_json() {
            Some(Value::Array(items)) => {
                for pair in items.chunks(2) {
                    if let [uid, count] = pair {
                        if let (Some(uid), Some(count)) = (uid.as_i64(), count.as_i64()) {
                            self.registry.merge_room_count(to_user_id(uid), count);
                        }
                    }
                }
            }
            Some(Value::Object(map)) => {
                for (uid_text, count) in map {
                    if let (Ok(uid), Some(count)) = (uid_text.parse::<i64>(), count.as_i64()) {
                        self.registry.merge_room_count(to_user_id(uid), count);
                    }
                }
            }
            _ => {}
        }
    }
}

// Indirection fields arrive as strings or numbers depending on server
// version; either renders into the query string as-is.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
