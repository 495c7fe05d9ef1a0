//! Wire-level enumerations and protocol constants.
//!
//! The numeric values here form the wire contract with the FC service and
//! are reproduced verbatim, including the channel id bands whose bases are
//! historical and carry no further meaning.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel that opens every binary-dialect frame. Any other value in the
/// magic slot is a framing error and the connection must be dropped.
pub const MAGIC: i32 = -2027771214;

/// Fixed port for the binary socket dialect.
pub const BINARY_PORT: u16 = 8100;

/// Fixed path for the WebSocket dialect.
pub const WEBSOCKET_PATH: &str = "/fcsl";

/// Handshake line sent immediately after a WebSocket opens.
pub const WEBSOCKET_HELLO: &str = "hello fcserver\n\0";

/// Login version code sent in `n_arg1` by binary-dialect clients.
pub const LOGIN_VERSION_BINARY: i32 = 20071025;

/// Login version code sent in `n_arg1` by WebSocket clients.
pub const LOGIN_VERSION_WEBSOCKET: i32 = 20080910;

/// Primary site host. The alternate site uses [`ALT_SITE_HOST`] and
/// prefixes usernames with [`ALT_SITE_USER_PREFIX`] in the login payload.
pub const SITE_HOST: &str = "myfreecams.com";
pub const ALT_SITE_HOST: &str = "camyou.com";
pub const ALT_SITE_USER_PREFIX: &str = "2/";

/// Packet kinds understood by the dispatcher.
///
/// Values not present in this table survive as [`FcType::Unknown`] so that
/// unknown packets can still be observed and logged by their numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FcType {
    Null,
    Login,
    AddFriend,
    PMesg,
    Status,
    Details,
    TokenInc,
    AddIgnore,
    Logout,
    UpdateStatus,
    RemoveFriend,
    SessionState,
    RemoveIgnore,
    CMesg,
    JoinChan,
    CreateChan,
    InviteChan,
    KickChan,
    QuietChan,
    BanChan,
    PreviewChan,
    Shutdown,
    ListBans,
    Unban,
    SetWelcome,
    ChanOp,
    ListChan,
    Tags,
    SetPcode,
    SetMinTip,
    UeOpt,
    HdVideo,
    Metrics,
    OfferCam,
    RequestCam,
    MyWebcam,
    MyCamState,
    PmHistory,
    ChatFlash,
    TruePvt,
    Bookmarks,
    Event,
    StateDump,
    Recommend,
    ExtData,
    Notify,
    Publish,
    XRequest,
    XResponse,
    EdgeCon,
    XMesg,
    ClubShow,
    ClubCmd,
    ZBan,
    GwConnect,
    ReloadSettings,
    HideUsers,
    RuleViolation,
    SessionType,
    SessionChallenge,
    ModelGroup,
    RequestPvt,
    RequestGrp,
    StatusReject,
    GroupChat,
    CloseGrp,
    Ucr,
    MyUcr,
    SlaveCon,
    SlaveCmd,
    SlaveFriend,
    SlaveVShare,
    RoomHelper,
    CMesgReply,
    Heartbeat,
    SlaveVShareCmd,
    RoomData,
    UeData,
    ManageList,
    InboxDump,
    ManageCam,
    PaymentRequest,
    PaymentResponse,
    GroupChatPart,
    TxProfile,
    UsernameLookup,
    /// A numeric packet kind this library does not know about.
    Unknown(i32),
}

impl FcType {
    /// Map a raw wire value to a packet kind, preserving unknown codes.
    pub fn from_raw(raw: i32) -> FcType {
        match raw {
            0 => FcType::Null,
            1 => FcType::Login,
            2 => FcType::AddFriend,
            3 => FcType::PMesg,
            4 => FcType::Status,
            5 => FcType::Details,
            6 => FcType::TokenInc,
            7 => FcType::AddIgnore,
            8 => FcType::Logout,
            9 => FcType::UpdateStatus,
            10 => FcType::RemoveFriend,
            11 => FcType::SessionState,
            12 => FcType::RemoveIgnore,
            13 => FcType::CMesg,
            14 => FcType::JoinChan,
            15 => FcType::CreateChan,
            16 => FcType::InviteChan,
            17 => FcType::KickChan,
            18 => FcType::QuietChan,
            19 => FcType::BanChan,
            20 => FcType::PreviewChan,
            21 => FcType::Shutdown,
            22 => FcType::ListBans,
            23 => FcType::Unban,
            24 => FcType::SetWelcome,
            25 => FcType::ChanOp,
            26 => FcType::ListChan,
            27 => FcType::Tags,
            28 => FcType::SetPcode,
            29 => FcType::SetMinTip,
            30 => FcType::UeOpt,
            31 => FcType::HdVideo,
            32 => FcType::Metrics,
            33 => FcType::OfferCam,
            34 => FcType::RequestCam,
            35 => FcType::MyWebcam,
            36 => FcType::MyCamState,
            37 => FcType::PmHistory,
            38 => FcType::ChatFlash,
            39 => FcType::TruePvt,
            40 => FcType::Bookmarks,
            41 => FcType::Event,
            42 => FcType::StateDump,
            43 => FcType::Recommend,
            44 => FcType::ExtData,
            45 => FcType::Notify,
            46 => FcType::Publish,
            47 => FcType::XRequest,
            48 => FcType::XResponse,
            49 => FcType::EdgeCon,
            50 => FcType::XMesg,
            51 => FcType::ClubShow,
            52 => FcType::ClubCmd,
            53 => FcType::ZBan,
            54 => FcType::GwConnect,
            55 => FcType::ReloadSettings,
            56 => FcType::HideUsers,
            57 => FcType::RuleViolation,
            58 => FcType::SessionType,
            59 => FcType::SessionChallenge,
            60 => FcType::ModelGroup,
            61 => FcType::RequestPvt,
            62 => FcType::RequestGrp,
            63 => FcType::StatusReject,
            64 => FcType::GroupChat,
            65 => FcType::CloseGrp,
            66 => FcType::Ucr,
            67 => FcType::MyUcr,
            68 => FcType::SlaveCon,
            69 => FcType::SlaveCmd,
            70 => FcType::SlaveFriend,
            71 => FcType::SlaveVShare,
            72 => FcType::RoomHelper,
            73 => FcType::CMesgReply,
            74 => FcType::Heartbeat,
            75 => FcType::SlaveVShareCmd,
            76 => FcType::RoomData,
            77 => FcType::UeData,
            78 => FcType::ManageList,
            79 => FcType::InboxDump,
            80 => FcType::ManageCam,
            81 => FcType::PaymentRequest,
            82 => FcType::PaymentResponse,
            83 => FcType::GroupChatPart,
            84 => FcType::TxProfile,
            85 => FcType::UsernameLookup,
            other => FcType::Unknown(other),
        }
    }

    /// Raw wire value for this packet kind.
    pub fn to_raw(self) -> i32 {
        match self {
            FcType::Null => 0,
            FcType::Login => 1,
            FcType::AddFriend => 2,
            FcType::PMesg => 3,
            FcType::Status => 4,
            FcType::Details => 5,
            FcType::TokenInc => 6,
            FcType::AddIgnore => 7,
            FcType::Logout => 8,
            FcType::UpdateStatus => 9,
            FcType::RemoveFriend => 10,
            FcType::SessionState => 11,
            FcType::RemoveIgnore => 12,
            FcType::CMesg => 13,
            FcType::JoinChan => 14,
            FcType::CreateChan => 15,
            FcType::InviteChan => 16,
            FcType::KickChan => 17,
            FcType::QuietChan => 18,
            FcType::BanChan => 19,
            FcType::PreviewChan => 20,
            FcType::Shutdown => 21,
            FcType::ListBans => 22,
            FcType::Unban => 23,
            FcType::SetWelcome => 24,
            FcType::ChanOp => 25,
            FcType::ListChan => 26,
            FcType::Tags => 27,
            FcType::SetPcode => 28,
            FcType::SetMinTip => 29,
            FcType::UeOpt => 30,
            FcType::HdVideo => 31,
            FcType::Metrics => 32,
            FcType::OfferCam => 33,
            FcType::RequestCam => 34,
            FcType::MyWebcam => 35,
            FcType::MyCamState => 36,
            FcType::PmHistory => 37,
            FcType::ChatFlash => 38,
            FcType::TruePvt => 39,
            FcType::Bookmarks => 40,
            FcType::Event => 41,
            FcType::StateDump => 42,
            FcType::Recommend => 43,
            FcType::ExtData => 44,
            FcType::Notify => 45,
            FcType::Publish => 46,
            FcType::XRequest => 47,
            FcType::XResponse => 48,
            FcType::EdgeCon => 49,
            FcType::XMesg => 50,
            FcType::ClubShow => 51,
            FcType::ClubCmd => 52,
            FcType::ZBan => 53,
            FcType::GwConnect => 54,
            FcType::ReloadSettings => 55,
            FcType::HideUsers => 56,
            FcType::RuleViolation => 57,
            FcType::SessionType => 58,
            FcType::SessionChallenge => 59,
            FcType::ModelGroup => 60,
            FcType::RequestPvt => 61,
            FcType::RequestGrp => 62,
            FcType::StatusReject => 63,
            FcType::GroupChat => 64,
            FcType::CloseGrp => 65,
            FcType::Ucr => 66,
            FcType::MyUcr => 67,
            FcType::SlaveCon => 68,
            FcType::SlaveCmd => 69,
            FcType::SlaveFriend => 70,
            FcType::SlaveVShare => 71,
            FcType::RoomHelper => 72,
            FcType::CMesgReply => 73,
            FcType::Heartbeat => 74,
            FcType::SlaveVShareCmd => 75,
            FcType::RoomData => 76,
            FcType::UeData => 77,
            FcType::ManageList => 78,
            FcType::InboxDump => 79,
            FcType::ManageCam => 80,
            FcType::PaymentRequest => 81,
            FcType::PaymentResponse => 82,
            FcType::GroupChatPart => 83,
            FcType::TxProfile => 84,
            FcType::UsernameLookup => 85,
            FcType::Unknown(raw) => raw,
        }
    }

    /// True for the packet kinds that carry candidate session-state
    /// updates. These drive the stricter logged-in silence watchdog.
    pub fn is_state_class(self) -> bool {
        matches!(
            self,
            FcType::Details
                | FcType::RoomHelper
                | FcType::SessionState
                | FcType::AddFriend
                | FcType::AddIgnore
                | FcType::CMesg
                | FcType::PMesg
                | FcType::TxProfile
                | FcType::UsernameLookup
                | FcType::MyCamState
                | FcType::MyWebcam
                | FcType::JoinChan
        )
    }
}

impl std::fmt::Display for FcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FcType::Unknown(raw) => write!(f, "{raw}"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// Channel options carried in `n_arg2` of JOINCHAN packets.
pub mod fcchan {
    pub const JOIN: i32 = 1;
    pub const PART: i32 = 2;
}

/// Option bits carried in `n_arg2` of EXTDATA packets.
pub mod fcwopt {
    /// Payload is an HTTP-indirect pointer into the service's response
    /// cache rather than inline data.
    pub const REDIS_JSON: i32 = 256;
}

/// Bulk list kinds carried in `n_arg2` of MANAGELIST packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Friends,
    Ignores,
    Roommates,
    Cams,
    Tags,
    Other(i32),
}

impl ListKind {
    pub fn from_raw(raw: i32) -> ListKind {
        match raw {
            1 => ListKind::Friends,
            2 => ListKind::Ignores,
            15 => ListKind::Roommates,
            16 => ListKind::Cams,
            20 => ListKind::Tags,
            other => ListKind::Other(other),
        }
    }
}

/// Video states reported in the `vs` session property.
///
/// An absent `vs` means the state is unknown, which is distinct from
/// [`VideoState::Offline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoState {
    TxIdle,
    TxReset,
    TxAway,
    TxConfirming,
    TxPvt,
    TxGrp,
    TxClub,
    TxKillModel,
    C2cOn,
    C2cOff,
    Offline,
    Unknown(i64),
}

impl VideoState {
    pub fn from_raw(raw: i64) -> VideoState {
        match raw {
            0 => VideoState::TxIdle,
            1 => VideoState::TxReset,
            2 => VideoState::TxAway,
            11 => VideoState::TxConfirming,
            12 => VideoState::TxPvt,
            13 => VideoState::TxGrp,
            14 => VideoState::TxClub,
            15 => VideoState::TxKillModel,
            20 => VideoState::C2cOn,
            21 => VideoState::C2cOff,
            90 => VideoState::Offline,
            other => VideoState::Unknown(other),
        }
    }

    pub fn to_raw(self) -> i64 {
        match self {
            VideoState::TxIdle => 0,
            VideoState::TxReset => 1,
            VideoState::TxAway => 2,
            VideoState::TxConfirming => 11,
            VideoState::TxPvt => 12,
            VideoState::TxGrp => 13,
            VideoState::TxClub => 14,
            VideoState::TxKillModel => 15,
            VideoState::C2cOn => 20,
            VideoState::C2cOff => 21,
            VideoState::Offline => 90,
            VideoState::Unknown(raw) => raw,
        }
    }
}

/// User levels reported in the `lv` session property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserLevel {
    Guest,
    Basic,
    Premium,
    Model,
    Admin,
    Other(i64),
}

impl UserLevel {
    pub fn from_raw(raw: i64) -> UserLevel {
        match raw {
            0 => UserLevel::Guest,
            1 => UserLevel::Basic,
            2 => UserLevel::Premium,
            4 => UserLevel::Model,
            5 => UserLevel::Admin,
            other => UserLevel::Other(other),
        }
    }
}

// Room/user id bands. A single entity is addressed either by its user id
// or by a room id in one of these bands; the 1e9 and 3e8 bases are part of
// the wire contract as-is.
pub const CHANNEL_ID_START: i64 = 100_000_000;
pub const SESSCHAN_ID_START: i64 = 200_000_000;
pub const CAMCHAN_ID_START: i64 = 400_000_000;
const BAND_HIGH: i64 = 1_000_000_000;
const BAND_MID: i64 = 300_000_000;

/// Normalize any room or user id to the plain user id.
pub fn to_user_id(id: i64) -> i64 {
    if id >= BAND_HIGH {
        id - BAND_HIGH
    } else if id >= CAMCHAN_ID_START {
        id - CAMCHAN_ID_START
    } else if id >= BAND_MID {
        id - BAND_MID
    } else if id >= SESSCHAN_ID_START {
        id - SESSCHAN_ID_START
    } else if id >= CHANNEL_ID_START {
        id - CHANNEL_ID_START
    } else {
        id
    }
}

/// Public-room id for a user id. The alternate site uses a different
/// channel base than the primary site.
pub fn to_room_id(id: i64, alt_site: bool) -> i64 {
    let uid = to_user_id(id);
    if alt_site {
        uid + CAMCHAN_ID_START
    } else {
        uid + CHANNEL_ID_START
    }
}

/// Server configuration document fetched from
/// `https://www.<host>/_js/serverconfig.js`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname prefixes for the binary socket dialect.
    #[serde(default)]
    pub chat_servers: Vec<String>,
    /// Hostname prefix to protocol tag for the WebSocket dialect.
    #[serde(default)]
    pub websocket_servers: HashMap<String, String>,
    /// Remaining fields are preserved but not interpreted.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ServerConfig {
    /// Last-known-good configuration used when the caller opts out of the
    /// startup fetch.
    pub fn cached() -> ServerConfig {
        ServerConfig {
            chat_servers: ["xchat20", "xchat22", "xchat26", "xchat27", "xchat39", "xchat62"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            websocket_servers: [("xchat100", "rfc6455"), ("xchat108", "rfc6455")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            extra: HashMap::new(),
        }
    }
}
