use crate::error::{LoraNsError, Result};
use std::fmt;

/// Only LoRaWAN R1 (major version 0) is understood
pub const MAX_SUPPORTED_VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MType {
    JoinRequest = 0,
    JoinAccept = 1,
    UnconfirmedDataUp = 2,
    UnconfirmedDataDown = 3,
    ConfirmedDataUp = 4,
    ConfirmedDataDown = 5,
    Rfu = 6,
    Proprietary = 7,
}

impl MType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedDataUp,
            3 => MType::UnconfirmedDataDown,
            4 => MType::ConfirmedDataUp,
            5 => MType::ConfirmedDataDown,
            6 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }

    /// Sent by the end-device
    pub fn is_uplink(&self) -> bool {
        matches!(
            self,
            MType::JoinRequest | MType::UnconfirmedDataUp | MType::ConfirmedDataUp
        )
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self,
            MType::UnconfirmedDataUp
                | MType::UnconfirmedDataDown
                | MType::ConfirmedDataUp
                | MType::ConfirmedDataDown
        )
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MType::JoinRequest => "JoinRequest",
            MType::JoinAccept => "JoinAccept",
            MType::UnconfirmedDataUp => "UnconfirmedDataUp",
            MType::UnconfirmedDataDown => "UnconfirmedDataDown",
            MType::ConfirmedDataUp => "ConfirmedDataUp",
            MType::ConfirmedDataDown => "ConfirmedDataDown",
            MType::Rfu => "RFU",
            MType::Proprietary => "Proprietary",
        };
        write!(f, "{}", name)
    }
}

/// MAC header: message type in bits 7..5, major version in bits 1..0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MHdr {
    pub mtype: MType,
    pub major_version: u8,
}

impl MHdr {
    pub fn new(mtype: MType) -> Self {
        Self {
            mtype,
            major_version: MAX_SUPPORTED_VERSION,
        }
    }

    pub fn decode(octet: u8) -> Result<Self> {
        let mtype = MType::from_bits((octet & 0xE0) >> 5);
        let major_version = octet & 0x03;
        if major_version > MAX_SUPPORTED_VERSION {
            return Err(LoraNsError::UnsupportedVersion(major_version));
        }
        Ok(Self {
            mtype,
            major_version,
        })
    }

    pub fn encode(&self) -> u8 {
        ((self.mtype as u8 & 0x07) << 5) | (self.major_version & 0x03)
    }
}
