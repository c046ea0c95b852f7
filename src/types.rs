//! Domain types shared across the master client and the server querier.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;

/// A Steam application id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize)]
pub struct AppId(pub u32);

impl AppId {
    /// Counter-Strike: Global Offensive. Valve disabled A2S_RULES for this
    /// app id; the querier skips the rules query for it unconditionally.
    pub const CSGO: AppId = AppId(730);
    /// The Ship, which carries three extra A2S_INFO fields.
    pub const THE_SHIP: AppId = AppId(2400);

    /// GoldSrc (HL1-engine) applications, all below id 80.
    pub const HL1_APPS: &'static [AppId] = &[
        AppId(10),
        AppId(20),
        AppId(30),
        AppId(40),
        AppId(50),
        AppId(60),
        AppId(70),
        AppId(80),
    ];

    /// Source (HL2-engine) applications.
    pub const HL2_APPS: &'static [AppId] = &[
        AppId(215),
        AppId(218),
        AppId(240),
        AppId(300),
        AppId(320),
        AppId(360),
        AppId(440),
        AppId(500),
        AppId(550),
        AppId(630),
        AppId(2130),
        AppId(2400),
        AppId(2450),
        AppId(4000),
        AppId(17500),
        AppId(17510),
        AppId(17520),
        AppId(17530),
        AppId(17550),
        AppId(17570),
        AppId(17580),
        AppId(17700),
        AppId(17710),
        AppId(17730),
        AppId(17740),
        AppId(70000),
        AppId(91700),
        AppId(222880),
        AppId(224260),
        AppId(225600),
        AppId(238430),
        AppId(243750),
        AppId(244630),
        AppId(265630),
    ];

    /// Source apps whose multi-packet A2S_RULES header lacks `packet_size`.
    pub const PRE_ORANGE_BOX_APPS: &'static [AppId] = &[
        AppId(215),
        AppId(17550),
        AppId(17700),
        AppId(244630),
        AppId(253530),
    ];

    pub fn is_pre_orange_box(self) -> bool {
        Self::PRE_ORANGE_BOX_APPS.contains(&self)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either of the two A2S wire variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEngine {
    GoldSrc,
    Source,
}

/// `S2A_INFO` version bytes.
pub const A2S_INFO_GOLDSRC: u8 = 0x6d;
pub const A2S_INFO_SOURCE: u8 = 0x49;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    #[default]
    Unknown,
    Dedicated,
    Listen,
    #[serde(rename = "hltv")]
    Hltv,
}

impl ServerKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'd' => ServerKind::Dedicated,
            b'l' => ServerKind::Listen,
            b'p' => ServerKind::Hltv,
            _ => ServerKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerOs {
    #[default]
    Unknown,
    Windows,
    Linux,
    Mac,
}

impl ServerOs {
    pub fn from_byte(b: u8) -> Self {
        match b {
            b'l' => ServerOs::Linux,
            b'w' => ServerOs::Windows,
            b'm' | b'o' => ServerOs::Mac,
            _ => ServerOs::Unknown,
        }
    }
}

/// Optional mod metadata returned only by GoldSrc servers with `is_mod == 1`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModInfo {
    pub url: String,
    pub download_url: String,
    pub version: u32,
    pub size: u32,
    pub kind: u8,
    pub dll: u8,
}

/// Present only for application id 2400 (The Ship).
#[derive(Debug, Clone, serde::Serialize)]
pub struct TheShipInfo {
    pub mode: u8,
    pub witnesses: u8,
    pub duration: u8,
}

/// SourceTV relay port + name, present when EDF bit 0x40 is set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpecTvInfo {
    pub port: u16,
    pub name: String,
}

/// Source extended-data-flags fields. Most are `None` unless their EDF bit
/// was set in the reply.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExtInfo {
    pub app_id: AppId,
    pub game_version: String,
    pub port: Option<u16>,
    pub steam_id: Option<u64>,
    pub game_mode_description: Option<String>,
    /// The full 64-bit composite game id, present only when EDF bit 0x01 is
    /// set. `app_id` is overridden with its low 24 bits; this field retains
    /// the whole value for consumers that want the type/mod bits too.
    pub game_id: Option<u64>,
}

/// The decoded A2S_INFO reply.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerInfo {
    pub address: SocketAddrV4,
    pub info_version: u8,
    pub protocol: u8,
    pub name: String,
    pub map_name: String,
    pub folder: String,
    pub game: String,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
    pub kind: ServerKind,
    pub os: ServerOs,
    pub visibility: u8,
    pub vac: u8,
    pub r#mod: Option<ModInfo>,
    pub the_ship: Option<TheShipInfo>,
    pub spec_tv: Option<SpecTvInfo>,
    pub ext: Option<ExtInfo>,
}

impl ServerInfo {
    /// GoldSrc if the reply was explicitly that version or carries no
    /// extended data, or if its (possibly overridden) app id is below 80 —
    /// every GoldSrc application id is under that threshold. Otherwise Source.
    pub fn game_engine(&self) -> GameEngine {
        if self.info_version == A2S_INFO_GOLDSRC {
            return GameEngine::GoldSrc;
        }
        match &self.ext {
            None => GameEngine::GoldSrc,
            Some(ext) if ext.app_id.0 < 80 => GameEngine::GoldSrc,
            Some(_) => GameEngine::Source,
        }
    }
}

/// An unordered variable-name to value mapping from A2S_RULES. Later
/// duplicate keys overwrite earlier ones, matching the wire protocol's lack
/// of uniqueness guarantees.
pub type Rules = HashMap<String, String>;

/// One fully queried server: its address, decoded info, and optional rules.
pub type ServerRecord = (SocketAddrV4, ServerInfo, Option<Rules>);
