use super::lorawan::{AesKey, DevAddr, Eui};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a device got its session keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    /// Over-the-air activation (join handshake)
    Otaa,
    /// Activation by personalisation (provisioned keys)
    Abp,
    #[default]
    Disabled,
}

/// A device and its session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub dev_eui: Eui,
    pub app_eui: Eui,
    pub dev_addr: DevAddr,
    pub app_key: AesKey,
    pub nwk_skey: AesKey,
    pub app_skey: AesKey,
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default)]
    pub fcnt_up: u16,
    #[serde(default)]
    pub fcnt_dn: u16,
    /// Accept frame counters that go backwards (devices that reset without rejoining)
    #[serde(default)]
    pub relaxed_counter: bool,
    /// Set when more than one device with the same DevAddr matched a MIC
    #[serde(default)]
    pub key_warning: bool,
    #[serde(default)]
    pub dev_nonce_history: Vec<u16>,
}

impl Device {
    pub fn has_dev_nonce(&self, dev_nonce: u16) -> bool {
        self.dev_nonce_history.contains(&dev_nonce)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub app_eui: Eui,
    #[serde(default)]
    pub name: Option<String>,
}

/// One decrypted uplink as persisted for the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    pub dev_eui: Eui,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub gateway_eui: Eui,
    pub rssi: i32,
    pub snr: f32,
    pub frequency: f32,
    pub data_rate: String,
    pub dev_addr: DevAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamState {
    Unsent,
    Sent,
    Acknowledged,
}

/// Application payload queued for delivery to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamMessage {
    pub dev_eui: Eui,
    pub payload: Vec<u8>,
    pub port: u8,
    /// Device must acknowledge the frame before the message is complete
    pub ack: bool,
    pub created: DateTime<Utc>,
    pub sent: Option<DateTime<Utc>>,
    pub ack_time: Option<DateTime<Utc>>,
}

impl DownstreamMessage {
    pub fn new(dev_eui: Eui, port: u8, payload: Vec<u8>, ack: bool) -> Self {
        Self {
            dev_eui,
            payload,
            port,
            ack,
            created: Utc::now(),
            sent: None,
            ack_time: None,
        }
    }

    pub fn state(&self) -> DownstreamState {
        match (self.sent, self.ack_time) {
            (None, _) => DownstreamState::Unsent,
            (Some(_), None) => DownstreamState::Sent,
            (Some(_), Some(_)) => DownstreamState::Acknowledged,
        }
    }

    /// Sent, and acknowledged if an ack was requested
    pub fn is_complete(&self) -> bool {
        if self.sent.is_none() {
            return false;
        }
        !(self.ack && self.ack_time.is_none())
    }
}
