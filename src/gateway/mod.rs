//! Gateway transport: Semtech UDP packet forwarder protocol

pub mod forwarder;
pub mod semtech;
pub mod wire;

pub use forwarder::{ForwarderHandle, GatewayChannels, UdpPacketForwarder};
pub use semtech::{RxData, Rxpk, TxData, Txpk};
pub use wire::{GatewayMessage, Identifier, PROTOCOL_VERSION};
