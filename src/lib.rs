//! Async client for the FC chat/broadcast service.
//!
//! camlink keeps a persistent connection to the service, decodes its
//! framed packet stream, and folds every server event into an observable
//! registry of broadcaster models with per-session state.
//!
//! # Features
//!
//! - **Two wire dialects**: the textual WebSocket framing (default) and
//!   the length-prefixed binary socket framing
//! - **Self-healing connection**: silence watchdogs and capped
//!   exponential reconnect
//! - **Observable model registry**: field-level change events, "best
//!   session" reconciliation across overlapping snapshots, tag sets
//! - **Typed packet events**: subscribe by packet kind or to everything
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use camlink::{Client, ClientEvent};
//!
//! #[tokio::main]
//! async fn main() -> camlink::Result<()> {
//!     let client = Client::new("guest", "guest");
//!     let mut events = client.events();
//!
//!     client.connect_and_wait_for_models().await?;
//!     println!("{} models online", client.registry().len());
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ClientEvent::Packet(packet) = event {
//!             if let Some(line) = packet.chat_string() {
//!                 println!("{line}");
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Protocol layers
pub mod codec;
pub mod constants;
pub mod packet;

// Model state and observation
pub mod events;
pub mod listdata;
pub mod model;
pub mod registry;
pub mod state;

// Connection machinery
mod client;
mod conn;
mod dispatch;
pub mod transport;

// External collaborators
pub mod emote;
mod error;
pub mod http;

// Core exports
pub use client::{Client, ClientOptions, UserRef};
pub use conn::ConnectionState;
pub use error::{ClientError, Result};
pub use events::{ClientEvent, EventKey, EventBus, ListenerId};
pub use model::Model;
pub use packet::{clean_emotes, Packet, Payload};
pub use registry::{ChangeEvent, ModelRegistry, WhenId, ANY_PROPERTY};
pub use state::SessionState;

// Protocol exports
pub use codec::{BinaryCodec, TextDecoder, TxFrame};
pub use constants::{to_room_id, to_user_id, FcType, ServerConfig, UserLevel, VideoState};

// Collaborator contracts
pub use emote::{EmoteEncoder, PlainEmoteEncoder};
pub use http::{HttpFetcher, ReqwestFetcher};
pub use transport::{PacketSink, PacketSource, TransportPair};
