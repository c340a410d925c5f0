//! JSON sentences carried by PushData and PullResp

use serde::{Deserialize, Serialize};

/// Received frame as reported by the concentrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rxpk {
    pub time: Option<String>,
    /// Concentrator clock, microseconds
    pub tmst: u32,
    /// MHz
    pub freq: f32,
    pub chan: u8,
    pub rfch: u8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub rssi: i32,
    pub lsnr: f32,
    pub size: u32,
    /// Base64 PHY payload
    pub data: String,
}

/// Upstream body. Gateway status (`stat`) is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RxData {
    #[serde(default)]
    pub rxpk: Vec<Rxpk>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Frame to transmit. `tmst` and `time` are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring `tmst` and `time`
    pub imme: bool,
    /// Concentrator clock to transmit at; a wrapped value of 0 is valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub freq: f32,
    pub rfch: u8,
    /// dBm
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub powe: u32,
    pub modu: String,
    pub datr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub codr: String,
    /// FSK frequency deviation, Hz
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub fdev: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ipol: bool,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub prea: u32,
    pub size: usize,
    pub data: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ncrc: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxData {
    pub txpk: Txpk,
}
