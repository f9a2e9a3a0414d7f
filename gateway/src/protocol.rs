//! Downstream WebSocket protocol: tagged JSON messages over `/ws`.
//!
//! Encoded as a tagged variant on both legs so an unrecognized `type` is a
//! structured decode error rather than a silently-mismatched byte layout —
//! unknown inbound types are logged and ignored rather than rejected at the
//! transport level, per the session contract.

use serde::{Deserialize, Serialize};

use crate::store::VesselRecord;

/// Messages accepted from a downstream client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { tiles: Vec<String> },
    Unsubscribe { tiles: Vec<String> },
    Ping,
}

/// Messages pushed to a downstream client. Cloneable: the dispatcher builds
/// one message per dirty tile and clones it once per subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
        message: String,
    },
    Subscribed {
        tiles: Vec<String>,
        message: String,
    },
    Unsubscribed {
        tiles: Vec<String>,
        message: String,
    },
    VesselUpdate {
        tile: String,
        vessels: Vec<VesselDto>,
    },
    Pong,
}

impl ServerMessage {
    /// Control messages are never dropped by a session's bounded outbound
    /// queue; only `VesselUpdate` is droppable under overflow.
    pub fn is_control(&self) -> bool {
        !matches!(self, ServerMessage::VesselUpdate { .. })
    }
}

/// Wire representation of a vessel, independent of the store's internal
/// record shape.
#[derive(Debug, Clone, Serialize)]
pub struct VesselDto {
    pub mmsi: u64,
    pub lat: f64,
    pub lon: f64,
    pub cog: Option<f64>,
    pub sog: Option<f64>,
    pub heading: Option<u16>,
    pub timestamp: String,
    pub tile: String,
}

impl From<&VesselRecord> for VesselDto {
    fn from(v: &VesselRecord) -> Self {
        VesselDto {
            mmsi: v.mmsi,
            lat: v.lat,
            lon: v.lon,
            cog: v.cog,
            sog: v.sog,
            heading: v.heading,
            timestamp: v.timestamp.to_rfc3339(),
            tile: v.tile.to_string(),
        }
    }
}
