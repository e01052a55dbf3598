//! Wire frames for the broker's realtime websocket API.
//!
//! Every frame is a JSON object tagged by its `trnm` field. Quote values
//! arrive as strings with a `+`/`-` direction prefix that must be stripped
//! before parsing.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::json;

/// Realtime type code for quote updates.
pub const REAL_TYPE_QUOTE: &str = "0A";
/// Realtime type code for executed trades.
pub const REAL_TYPE_TRADE: &str = "0B";
/// Field id carrying the current price inside a REAL entry.
pub const PRICE_FIELD: &str = "10";
/// SYSTEM code sent when another session logs in with the same token.
pub const SYSTEM_DUPLICATE_SESSION: &str = "R10001";

#[derive(Debug, Deserialize)]
#[serde(tag = "trnm")]
pub enum ServerFrame {
    #[serde(rename = "LOGIN")]
    Login {
        #[serde(default)]
        return_code: Option<i64>,
        #[serde(default)]
        return_msg: Option<String>,
    },
    /// Heartbeat; must be echoed back verbatim.
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "REG")]
    RegAck {
        #[serde(default)]
        return_code: Option<i64>,
        #[serde(default)]
        return_msg: Option<String>,
    },
    #[serde(rename = "REMOVE")]
    RemoveAck {
        #[serde(default)]
        return_code: Option<i64>,
    },
    #[serde(rename = "REAL")]
    Real {
        #[serde(default)]
        data: Vec<RealEntry>,
    },
    #[serde(rename = "SYSTEM")]
    System {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// One instrument's update inside a REAL frame.
#[derive(Debug, Deserialize)]
pub struct RealEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub item: String,
    #[serde(default)]
    pub values: HashMap<String, String>,
}

impl RealEntry {
    pub fn is_price_update(&self) -> bool {
        self.kind == REAL_TYPE_QUOTE || self.kind == REAL_TYPE_TRADE
    }

    /// Current price from field 10, sign prefix stripped. `None` when the
    /// field is absent or not a whole number.
    pub fn price(&self) -> Option<i64> {
        let raw = self.values.get(PRICE_FIELD)?;
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| *c != '+' && *c != '-' && *c != ',')
            .collect();
        cleaned.parse().ok()
    }
}

pub fn login_frame(token: &str) -> String {
    json!({ "trnm": "LOGIN", "token": token }).to_string()
}

pub fn register_frame(instrument: &str) -> String {
    json!({
        "trnm": "REG",
        "grp_no": "1",
        "refresh": "1",
        "data": [{
            "item": [instrument],
            "type": [REAL_TYPE_QUOTE, REAL_TYPE_TRADE],
        }],
    })
    .to_string()
}

pub fn remove_frame(instrument: &str) -> String {
    json!({
        "trnm": "REMOVE",
        "grp_no": "1",
        "refresh": "1",
        "data": [{
            "item": [instrument],
            "type": [REAL_TYPE_QUOTE, REAL_TYPE_TRADE],
        }],
    })
    .to_string()
}
