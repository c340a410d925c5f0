use super::lorawan::Eui;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A registered gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub gateway_eui: Eui,
    pub ip: IpAddr,
    /// Only accept traffic from `ip`
    #[serde(default)]
    pub strict_ip: bool,
    #[serde(default)]
    pub location: Option<GatewayLocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayLocation {
    pub latitude: f32,
    pub longitude: f32,
    pub altitude: f32,
}

/// Telemetry emitted by the gateway transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum GatewayEvent {
    KeepAlive,
    Rx(String),
    Tx(String),
    Inactive,
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::KeepAlive => "KeepAlive",
            GatewayEvent::Rx(_) => "Rx",
            GatewayEvent::Tx(_) => "Tx",
            GatewayEvent::Inactive => "Inactive",
        }
    }
}
