use crate::error::LoraNsError;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

/// 64-bit extended unique identifier (device, application or gateway)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Eui(pub [u8; 8]);

impl Eui {
    pub fn new(octets: [u8; 8]) -> Self {
        Self(octets)
    }

    /// The most significant byte of the value is the first octet
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", parts.join("-"))
    }
}

impl FromStr for Eui {
    type Err = LoraNsError;

    /// Accepts `00-11-22-33-44-55-66-77`, `00:11:..` or plain hex
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != ':')
            .collect();
        if cleaned.len() != 16 {
            return Err(LoraNsError::InvalidFormat(format!(
                "EUI must be 16 hex characters: {}",
                s
            )));
        }
        let mut octets = [0u8; 8];
        hex::decode_to_slice(&cleaned, &mut octets)
            .map_err(|e| LoraNsError::InvalidFormat(format!("EUI {}: {}", s, e)))?;
        Ok(Self(octets))
    }
}

impl Serialize for Eui {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eui {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Device address: 7-bit NwkID followed by a 25-bit NwkAddr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevAddr(pub u32);

impl DevAddr {
    const NWK_ADDR_MASK: u32 = 0x01FF_FFFF;

    pub fn new(nwk_id: u8, nwk_addr: u32) -> Self {
        Self(u32::from(nwk_id & 0x7F) << 25 | (nwk_addr & Self::NWK_ADDR_MASK))
    }

    pub fn nwk_id(&self) -> u8 {
        (self.0 >> 25) as u8
    }

    pub fn nwk_addr(&self) -> u32 {
        self.0 & Self::NWK_ADDR_MASK
    }

    pub fn to_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = LoraNsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s.trim(), 16)
            .map(DevAddr)
            .map_err(|e| LoraNsError::InvalidFormat(format!("DevAddr {}: {}", s, e)))
    }
}

impl Serialize for DevAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DevAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// AES-128 key. The key material is wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub fn new(key: [u8; 16]) -> Self {
        Self(key)
    }

    /// Random key from the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encrypt a single block with this key
    pub fn encrypt_block(&self, block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(&self.0));
        let mut out = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut out);
        let mut ret = [0u8; 16];
        ret.copy_from_slice(&out);
        ret
    }
}

impl Drop for AesKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AesKey(****)")
    }
}

impl fmt::Display for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for AesKey {
    type Err = LoraNsError;

    /// Hex string, spaces are ignored ("01 02 03 ..." is fine)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.len() != 32 {
            return Err(LoraNsError::InvalidFormat(
                "AES key must be 32 hex characters".to_string(),
            ));
        }
        let mut key = [0u8; 16];
        hex::decode_to_slice(&cleaned, &mut key)
            .map_err(|e| LoraNsError::InvalidFormat(format!("AES key: {}", e)))?;
        Ok(Self(key))
    }
}

impl Serialize for AesKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AesKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 24-bit network identifier
pub type NetId = u32;
