//! Semtech UDP packet forwarder framing:
//! `version | token (BE u16) | identifier | body`

use crate::error::{LoraNsError, Result};
use crate::model::lorawan::Eui;
use std::fmt;
use tracing::error;

const HEADER_LEN: usize = 4;
const EUI_HEADER_LEN: usize = 12;

/// Protocol version written by the reference packet forwarder
pub const PROTOCOL_VERSION: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identifier {
    /// Gateway pushes uplinks and status
    PushData,
    PushAck,
    /// Gateway keepalive, opens the downlink path through NAT
    PullData,
    /// Server sends a downlink
    PullResp,
    PullAck,
    /// Gateway reports the outcome of a PullResp
    TxAck,
    Unknown(u8),
}

impl Identifier {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Identifier::PushData,
            1 => Identifier::PushAck,
            2 => Identifier::PullData,
            3 => Identifier::PullResp,
            4 => Identifier::PullAck,
            5 => Identifier::TxAck,
            other => Identifier::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Identifier::PushData => 0,
            Identifier::PushAck => 1,
            Identifier::PullData => 2,
            Identifier::PullResp => 3,
            Identifier::PullAck => 4,
            Identifier::TxAck => 5,
            Identifier::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::PushData => f.write_str("PUSH_DATA"),
            Identifier::PushAck => f.write_str("PUSH_ACK"),
            Identifier::PullData => f.write_str("PULL_DATA"),
            Identifier::PullResp => f.write_str("PULL_RESP"),
            Identifier::PullAck => f.write_str("PULL_ACK"),
            Identifier::TxAck => f.write_str("TX_ACK"),
            Identifier::Unknown(id) => write!(f, "UNKNOWN({})", id),
        }
    }
}

/// One datagram to or from a gateway. `host`/`port` is the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayMessage {
    pub protocol_version: u8,
    pub token: u16,
    pub identifier: Identifier,
    /// Only carried by PushData and PullData
    pub gateway_eui: Eui,
    pub json: Option<String>,
    pub host: String,
    pub port: u16,
}

impl GatewayMessage {
    pub fn new(identifier: Identifier, token: u16) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            token,
            identifier,
            gateway_eui: Eui::default(),
            json: None,
            host: String::new(),
            port: 0,
        }
    }

    /// Response to `self` with the same version, token and remote end
    pub fn reply(&self, identifier: Identifier) -> Self {
        Self {
            protocol_version: self.protocol_version,
            token: self.token,
            identifier,
            gateway_eui: self.gateway_eui,
            json: None,
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(LoraNsError::BufferTruncated(format!(
                "gateway message needs {} bytes, got {}",
                HEADER_LEN,
                data.len()
            )));
        }
        let mut msg = Self::new(
            Identifier::from_u8(data[3]),
            u16::from_be_bytes([data[1], data[2]]),
        );
        msg.protocol_version = data[0];

        match msg.identifier {
            Identifier::PushData | Identifier::PullData => {
                if data.len() < EUI_HEADER_LEN {
                    return Err(LoraNsError::BufferTruncated(format!(
                        "{} needs {} bytes, got {}",
                        msg.identifier,
                        EUI_HEADER_LEN,
                        data.len()
                    )));
                }
                let mut eui = [0u8; 8];
                eui.copy_from_slice(&data[HEADER_LEN..EUI_HEADER_LEN]);
                msg.gateway_eui = Eui::from_u64(u64::from_be_bytes(eui));
                if msg.identifier == Identifier::PushData {
                    msg.json = json_body(&data[EUI_HEADER_LEN..]);
                }
            }
            Identifier::PullResp | Identifier::TxAck => {
                msg.json = json_body(&data[HEADER_LEN..]);
            }
            Identifier::PushAck | Identifier::PullAck => {}
            Identifier::Unknown(id) => return Err(LoraNsError::UnknownIdentifier(id)),
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = self.json.as_deref().unwrap_or("");
        let mut buffer = Vec::with_capacity(EUI_HEADER_LEN + json.len());
        buffer.push(self.protocol_version);
        buffer.extend_from_slice(&self.token.to_be_bytes());

        match self.identifier {
            Identifier::PushAck | Identifier::PullAck => {
                buffer.push(self.identifier.to_u8());
            }
            Identifier::PullData => {
                buffer.push(self.identifier.to_u8());
                buffer.extend_from_slice(&self.gateway_eui.to_u64().to_be_bytes());
            }
            Identifier::PushData => {
                buffer.push(self.identifier.to_u8());
                buffer.extend_from_slice(&self.gateway_eui.to_u64().to_be_bytes());
                buffer.extend_from_slice(json.as_bytes());
            }
            Identifier::PullResp | Identifier::TxAck => {
                buffer.push(self.identifier.to_u8());
                buffer.extend_from_slice(json.as_bytes());
            }
            Identifier::Unknown(id) => {
                error!("Don't know how to encode gateway message identifier {}", id);
                return Err(LoraNsError::UnknownIdentifier(id));
            }
        }
        Ok(buffer)
    }
}

fn json_body(data: &[u8]) -> Option<String> {
    if data.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(data).into_owned())
    }
}
