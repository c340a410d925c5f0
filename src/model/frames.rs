use super::device::{Application, Device};
use super::lorawan::Eui;
use crate::band::BandPlan;
use crate::protocol::{MacCommand, PhyPayload};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Radio parameters for a received frame. Read-only once decoded.
#[derive(Debug, Clone)]
pub struct RadioContext {
    pub channel: u8,
    pub rf_chain: u8,
    /// MHz
    pub frequency: f32,
    /// Gateway data-rate string, e.g. "SF7BW125"
    pub data_rate: String,
    pub band: Arc<dyn BandPlan>,
    /// Seconds
    pub rx1_delay: u8,
    pub rx2_delay: u8,
    pub rssi: i32,
    pub snr: f32,
}

impl RadioContext {
    pub fn new(band: Arc<dyn BandPlan>) -> Self {
        Self {
            channel: 0,
            rf_chain: 0,
            frequency: 0.0,
            data_rate: String::new(),
            band,
            rx1_delay: 0,
            rx2_delay: 0,
            rssi: 0,
            snr: 0.0,
        }
    }
}

/// Where a frame came from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GatewayContext {
    pub gateway_eui: Eui,
    pub host: String,
    pub port: u16,
    /// Concentrator clock (microseconds) at reception
    pub gateway_clock: u32,
    pub protocol_version: u8,
}

/// A raw radio frame travelling between the transport and the pipeline
#[derive(Debug, Clone)]
pub struct GatewayPacket {
    pub raw: Vec<u8>,
    pub radio: RadioContext,
    pub gateway: GatewayContext,
    pub received_at: Instant,
    /// Time budget from `received_at` for getting the frame to the gateway
    pub deadline: Duration,
}

impl GatewayPacket {
    pub fn new(raw: Vec<u8>, radio: RadioContext, gateway: GatewayContext) -> Self {
        Self {
            raw,
            radio,
            gateway,
            received_at: Instant::now(),
            deadline: Duration::ZERO,
        }
    }
}

/// Packet plus the device/application resolved along the way
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub packet: GatewayPacket,
    pub device: Option<Device>,
    pub application: Option<Application>,
}

impl FrameContext {
    pub fn new(packet: GatewayPacket) -> Self {
        Self {
            packet,
            device: None,
            application: None,
        }
    }
}

/// Decoded frame with its context
#[derive(Debug, Clone)]
pub struct LoRaMessage {
    pub payload: PhyPayload,
    pub context: FrameContext,
}

/// Clear-text payload delivered to application subscribers
#[derive(Debug, Clone)]
pub struct PayloadMessage {
    pub payload: Vec<u8>,
    pub port: u8,
    pub device: Device,
    pub application: Application,
    pub mac_commands: Vec<MacCommand>,
    pub context: FrameContext,
}

impl PayloadMessage {
    /// JSON form handed to output connectors
    pub fn to_json(&self) -> serde_json::Value {
        let radio = &self.context.packet.radio;
        json!({
            "devEUI": self.device.dev_eui,
            "appEUI": self.application.app_eui,
            "devAddr": self.device.dev_addr,
            "port": self.port,
            "data": hex::encode(&self.payload),
            "gatewayEUI": self.context.packet.gateway.gateway_eui,
            "rssi": radio.rssi,
            "snr": radio.snr,
            "frequency": radio.frequency,
            "dataRate": radio.data_rate,
        })
    }
}
