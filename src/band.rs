//! Regional band plans. Only EU 863-870 MHz is provided.

use crate::error::{LoraNsError, Result};
use crate::protocol::DlSettings;
use std::fmt;

/// Maximum application payload for a data rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaximumPayloadSize {
    /// No FOpts in the frame
    pub without_fopts: u8,
    /// Frame carries FOpts
    pub with_fopts: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    LoRa,
    Fsk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub modulation: Modulation,
    pub spreading_factor: u8,
    /// kHz, LoRa only
    pub bandwidth: u32,
    /// bit/s
    pub bit_rate: u32,
}

/// Timing and default parameters for a band
#[derive(Debug, Clone, PartialEq)]
pub struct BandConfiguration {
    /// Seconds from end of uplink to the RX1 window
    pub receive_delay1: u8,
    pub receive_delay2: u8,
    /// RX1 delay for Join-Accept responses
    pub join_accept_delay1: u8,
    pub join_accept_delay2: u8,
    pub max_fcnt_gap: u32,
    pub default_tx_power: u8,
    /// MHz
    pub rx2_frequency: f32,
    pub rx2_data_rate: u8,
    /// MHz
    pub join_req_channels: Vec<f32>,
}

/// Frequency plan lookups used by the packet path
pub trait BandPlan: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn configuration(&self) -> &BandConfiguration;

    /// Data rate index for a gateway data-rate string such as "SF7BW125"
    fn data_rate(&self, datr: &str) -> Result<u8>;

    fn encoding(&self, data_rate: u8) -> Result<Encoding>;

    fn maximum_payload(&self, datr: &str) -> Result<MaximumPayloadSize>;

    /// Uplink frequency (MHz) for a concentrator channel when the gateway
    /// doesn't report one
    fn channel_frequency(&self, channel: u8) -> Option<f32>;

    fn otaa_dl_settings(&self) -> DlSettings;

    fn otaa_rx_delay(&self) -> u8;
}

/// EU 863-870 MHz ISM band
#[derive(Debug, Clone)]
pub struct Eu868 {
    configuration: BandConfiguration,
}

const EU868_CHANNELS: [f32; 8] = [868.1, 868.3, 868.5, 867.1, 867.3, 867.5, 867.7, 867.9];

impl Eu868 {
    pub fn new() -> Self {
        Self {
            configuration: BandConfiguration {
                receive_delay1: 1,
                receive_delay2: 2,
                join_accept_delay1: 5,
                join_accept_delay2: 6,
                max_fcnt_gap: 16384,
                default_tx_power: 14,
                rx2_frequency: 869.525,
                rx2_data_rate: 0,
                join_req_channels: vec![868.1, 868.3, 868.5],
            },
        }
    }
}

impl Default for Eu868 {
    fn default() -> Self {
        Self::new()
    }
}

impl BandPlan for Eu868 {
    fn name(&self) -> &'static str {
        "EU 863-870MHz ISM Band"
    }

    fn configuration(&self) -> &BandConfiguration {
        &self.configuration
    }

    fn data_rate(&self, datr: &str) -> Result<u8> {
        match datr {
            "SF12BW125" => Ok(0),
            "SF11BW125" => Ok(1),
            "SF10BW125" => Ok(2),
            "SF9BW125" => Ok(3),
            "SF8BW125" => Ok(4),
            "SF7BW125" => Ok(5),
            "SF7BW250" => Ok(6),
            "FSK" | "50000" => Ok(7),
            other => Err(LoraNsError::BandError(format!(
                "unknown data rate {}",
                other
            ))),
        }
    }

    fn encoding(&self, data_rate: u8) -> Result<Encoding> {
        let lora = |spreading_factor, bandwidth, bit_rate| Encoding {
            modulation: Modulation::LoRa,
            spreading_factor,
            bandwidth,
            bit_rate,
        };
        match data_rate {
            0 => Ok(lora(12, 125, 250)),
            1 => Ok(lora(11, 125, 440)),
            2 => Ok(lora(10, 125, 980)),
            3 => Ok(lora(9, 125, 1760)),
            4 => Ok(lora(8, 125, 3125)),
            5 => Ok(lora(7, 125, 5470)),
            6 => Ok(lora(7, 250, 11000)),
            7 => Ok(Encoding {
                modulation: Modulation::Fsk,
                spreading_factor: 0,
                bandwidth: 0,
                bit_rate: 50000,
            }),
            other => Err(LoraNsError::BandError(format!(
                "invalid data rate {}",
                other
            ))),
        }
    }

    fn maximum_payload(&self, datr: &str) -> Result<MaximumPayloadSize> {
        let size = |without_fopts, with_fopts| MaximumPayloadSize {
            without_fopts,
            with_fopts,
        };
        match self.data_rate(datr)? {
            0..=2 => Ok(size(59, 51)),
            3 => Ok(size(123, 115)),
            _ => Ok(size(230, 222)),
        }
    }

    fn channel_frequency(&self, channel: u8) -> Option<f32> {
        EU868_CHANNELS.get(usize::from(channel)).copied()
    }

    fn otaa_dl_settings(&self) -> DlSettings {
        DlSettings {
            rx1_dr_offset: 0,
            rx2_data_rate: 5,
        }
    }

    fn otaa_rx_delay(&self) -> u8 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eu868_maximum_payload() {
        let band = Eu868::new();
        let m = band.maximum_payload("SF12BW125").unwrap();
        assert_eq!(m.without_fopts, 59);
        assert_eq!(m.with_fopts, 51);
        assert_eq!(band.maximum_payload("SF9BW125").unwrap().without_fopts, 123);
        assert_eq!(band.maximum_payload("SF7BW125").unwrap().with_fopts, 222);
        assert_eq!(band.maximum_payload("SF7BW250").unwrap().without_fopts, 230);
        assert!(band.maximum_payload("SF6BW500").is_err());
    }

    #[test]
    fn test_eu868_encoding() {
        let band = Eu868::new();
        let enc = band.encoding(band.data_rate("SF10BW125").unwrap()).unwrap();
        assert_eq!(enc.spreading_factor, 10);
        assert_eq!(enc.modulation, Modulation::LoRa);
        assert_eq!(band.encoding(7).unwrap().modulation, Modulation::Fsk);
        assert!(band.encoding(8).is_err());
    }

    #[test]
    fn test_eu868_channel_frequency() {
        let band = Eu868::new();
        assert_eq!(band.channel_frequency(0), Some(868.1));
        assert_eq!(band.channel_frequency(7), Some(867.9));
        assert_eq!(band.channel_frequency(8), None);
    }

    #[test]
    fn test_eu868_otaa_defaults() {
        let band = Eu868::new();
        assert_eq!(band.otaa_dl_settings().encode(), 0x05);
        assert_eq!(band.otaa_rx_delay(), 1);
        assert_eq!(band.configuration().join_accept_delay1, 5);
        assert_eq!(band.configuration().receive_delay1, 1);
    }
}
