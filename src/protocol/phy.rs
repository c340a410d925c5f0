use super::crypto;
use super::fhdr::FHdr;
use super::mac::MacCommandSet;
use super::mhdr::{MHdr, MType};
use crate::error::{LoraNsError, Result};
use crate::model::lorawan::{AesKey, DevAddr, Eui, NetId};

/// MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4)
pub const MINIMUM_MESSAGE_SIZE: usize = 12;

/// Largest PHY payload we will put on the air
pub const MAX_PHY_PAYLOAD_SIZE: usize = 255;

/// Room for MAC commands sent in FRMPayload (port 0)
pub const MAX_MAC_COMMAND_PAYLOAD: usize = 222;

/// Highest application port; 224..255 are reserved
pub const MAX_FPORT: u8 = 223;

const JOIN_REQUEST_LEN: usize = 18;
const JOIN_ACCEPT_LEN: usize = 12;
const MIC_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DlSettings {
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
}

impl DlSettings {
    pub fn encode(&self) -> u8 {
        ((self.rx1_dr_offset & 0x07) << 4) | (self.rx2_data_rate & 0x0F)
    }

    pub fn decode(octet: u8) -> Self {
        Self {
            rx1_dr_offset: (octet & 0x70) >> 4,
            rx2_data_rate: octet & 0x0F,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinRequestPayload {
    pub app_eui: Eui,
    pub dev_eui: Eui,
    pub dev_nonce: u16,
}

impl JoinRequestPayload {
    fn decode(octets: &[u8]) -> Result<Self> {
        if octets.len() < JOIN_REQUEST_LEN {
            return Err(LoraNsError::BufferTruncated("join request".to_string()));
        }
        let le_u64 = |b: &[u8]| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&b[..8]);
            u64::from_le_bytes(arr)
        };
        Ok(Self {
            app_eui: Eui::from_u64(le_u64(&octets[0..8])),
            dev_eui: Eui::from_u64(le_u64(&octets[8..16])),
            dev_nonce: u16::from_be_bytes([octets[16], octets[17]]),
        })
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.app_eui.to_u64().to_le_bytes());
        buffer.extend_from_slice(&self.dev_eui.to_u64().to_le_bytes());
        buffer.extend_from_slice(&self.dev_nonce.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinAcceptPayload {
    pub app_nonce: [u8; 3],
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub dl_settings: DlSettings,
    pub rx_delay: u8,
}

impl JoinAcceptPayload {
    fn decode(octets: &[u8]) -> Result<Self> {
        if octets.len() < JOIN_ACCEPT_LEN {
            return Err(LoraNsError::BufferTruncated("join accept".to_string()));
        }
        Ok(Self {
            app_nonce: [octets[0], octets[1], octets[2]],
            net_id: u32::from(octets[3]) << 16 | u32::from(octets[4]) << 8 | u32::from(octets[5]),
            dev_addr: DevAddr(u32::from_le_bytes([
                octets[6], octets[7], octets[8], octets[9],
            ])),
            dl_settings: DlSettings::decode(octets[10]),
            rx_delay: octets[11],
        })
    }

    fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.app_nonce);
        buffer.push((self.net_id >> 16) as u8);
        buffer.push((self.net_id >> 8) as u8);
        buffer.push(self.net_id as u8);
        buffer.extend_from_slice(&self.dev_addr.to_u32().to_le_bytes());
        buffer.push(self.dl_settings.encode());
        buffer.push(self.rx_delay);
    }
}

/// FHDR plus port and FRMPayload. MAC commands sent on port 0 live in
/// `mac_commands` and are carried in clear text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacPayload {
    pub fhdr: FHdr,
    pub fport: u8,
    pub frm_payload: Vec<u8>,
    pub mac_commands: MacCommandSet,
}

impl MacPayload {
    pub fn new(uplink: bool) -> Self {
        Self {
            fhdr: FHdr::new(uplink),
            fport: 0,
            frm_payload: Vec::new(),
            mac_commands: MacCommandSet::new(uplink, MAX_MAC_COMMAND_PAYLOAD),
        }
    }

    fn decode(octets: &[u8], pos: &mut usize, uplink: bool) -> Result<Self> {
        let fhdr = FHdr::decode(octets, pos, uplink)?;
        let mut ret = Self {
            fhdr,
            ..Self::new(uplink)
        };

        let end = octets.len() - MIC_LEN;
        if *pos > end || end - *pos == 1 {
            // a port without payload is not allowed
            return Err(LoraNsError::BufferTruncated("FRMPayload".to_string()));
        }
        if *pos == end {
            return Ok(ret);
        }

        ret.fport = octets[*pos];
        *pos += 1;
        if ret.fport == 0 {
            ret.mac_commands = MacCommandSet::decode(&octets[*pos..end], uplink, MAX_PHY_PAYLOAD_SIZE);
        } else {
            ret.frm_payload = octets[*pos..end].to_vec();
        }
        *pos = end;
        Ok(ret)
    }

    fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if self.frm_payload.is_empty() {
            if !self.mac_commands.is_empty() {
                buffer.push(0);
                self.mac_commands.encode(buffer);
            }
            return Ok(());
        }
        if self.fport > MAX_FPORT {
            return Err(LoraNsError::ParameterOutOfRange(format!(
                "port {} is reserved",
                self.fport
            )));
        }
        if self.fport == 0 {
            return Err(LoraNsError::ParameterOutOfRange(
                "port 0 can't carry application payload".to_string(),
            ));
        }
        buffer.push(self.fport);
        buffer.extend_from_slice(&self.frm_payload);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(MacPayload),
    JoinRequest(JoinRequestPayload),
    JoinAccept(JoinAcceptPayload),
}

/// A complete LoRaWAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyPayload {
    pub mhdr: MHdr,
    pub payload: Payload,
    pub mic: u32,
}

impl PhyPayload {
    pub fn new(mtype: MType) -> Self {
        let payload = match mtype {
            MType::JoinRequest => Payload::JoinRequest(JoinRequestPayload::default()),
            MType::JoinAccept => Payload::JoinAccept(JoinAcceptPayload::default()),
            _ => Payload::Data(MacPayload::new(mtype.is_uplink())),
        };
        Self {
            mhdr: MHdr::new(mtype),
            payload,
            mic: 0,
        }
    }

    pub fn mtype(&self) -> MType {
        self.mhdr.mtype
    }

    /// Parses a frame as received from a gateway
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MINIMUM_MESSAGE_SIZE {
            return Err(LoraNsError::BufferTruncated(format!(
                "frame is {} bytes, minimum is {}",
                data.len(),
                MINIMUM_MESSAGE_SIZE
            )));
        }
        let mhdr = MHdr::decode(data[0])?;
        let n = data.len();
        let mic = u32::from_le_bytes([data[n - 4], data[n - 3], data[n - 2], data[n - 1]]);

        let payload = match mhdr.mtype {
            mtype if mtype.is_data() => {
                let mut pos = 1;
                Payload::Data(MacPayload::decode(data, &mut pos, mtype.is_uplink())?)
            }
            MType::JoinRequest => Payload::JoinRequest(JoinRequestPayload::decode(&data[1..n - 4])?),
            // Encrypted on the wire; see `decode_join_accept`
            MType::JoinAccept => Payload::JoinAccept(JoinAcceptPayload::decode(&data[1..n - 4])?),
            other => {
                return Err(LoraNsError::InvalidMessageType(other.to_string()));
            }
        };
        Ok(Self { mhdr, payload, mic })
    }

    pub fn mac_payload(&self) -> Option<&MacPayload> {
        match &self.payload {
            Payload::Data(p) => Some(p),
            _ => None,
        }
    }

    pub fn mac_payload_mut(&mut self) -> Option<&mut MacPayload> {
        match &mut self.payload {
            Payload::Data(p) => Some(p),
            _ => None,
        }
    }

    pub fn join_request(&self) -> Option<&JoinRequestPayload> {
        match &self.payload {
            Payload::JoinRequest(p) => Some(p),
            _ => None,
        }
    }

    pub fn join_accept(&self) -> Option<&JoinAcceptPayload> {
        match &self.payload {
            Payload::JoinAccept(p) => Some(p),
            _ => None,
        }
    }

    /// Serializes a data frame with the current MIC
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mac_payload = self
            .mac_payload()
            .ok_or_else(|| LoraNsError::InvalidMessageType(self.mtype().to_string()))?;
        let mut buffer = Vec::with_capacity(MAX_PHY_PAYLOAD_SIZE);
        buffer.push(self.mhdr.encode());
        mac_payload.fhdr.encode(&mut buffer)?;
        mac_payload.encode(&mut buffer)?;
        buffer.extend_from_slice(&self.mic.to_le_bytes());
        if buffer.len() > MAX_PHY_PAYLOAD_SIZE {
            return Err(LoraNsError::ParameterOutOfRange(format!(
                "frame is {} bytes",
                buffer.len()
            )));
        }
        Ok(buffer)
    }

    /// MIC of a data frame; `message` is the frame without its MIC
    pub fn calculate_mic(&self, nwk_skey: &AesKey, message: &[u8]) -> Result<u32> {
        let mac_payload = self
            .mac_payload()
            .ok_or_else(|| LoraNsError::InvalidMessageType(self.mtype().to_string()))?;
        Ok(crypto::data_mic(
            nwk_skey,
            self.mtype().is_uplink(),
            mac_payload.fhdr.dev_addr,
            mac_payload.fhdr.fcnt,
            message,
        ))
    }

    /// Encrypts or decrypts FRMPayload in place. Port 0 uses the network key.
    pub fn decrypt(&mut self, nwk_skey: &AesKey, app_skey: &AesKey) {
        let uplink = self.mtype().is_uplink();
        if let Some(mac_payload) = self.mac_payload_mut() {
            let key = if mac_payload.fport == 0 { nwk_skey } else { app_skey };
            mac_payload.frm_payload = crypto::crypt_frm_payload(
                key,
                uplink,
                mac_payload.fhdr.dev_addr,
                mac_payload.fhdr.fcnt,
                &mac_payload.frm_payload,
            );
        }
    }

    /// Encrypts the payload, signs the frame and returns its bytes
    pub fn encode_message(&mut self, nwk_skey: &AesKey, app_skey: &AesKey) -> Result<Vec<u8>> {
        self.decrypt(nwk_skey, app_skey);
        let mut buffer = self.marshal()?;
        let n = buffer.len();
        self.mic = self.calculate_mic(nwk_skey, &buffer[..n - MIC_LEN])?;
        buffer[n - MIC_LEN..].copy_from_slice(&self.mic.to_le_bytes());
        Ok(buffer)
    }

    /// Signs and wraps a Join-Accept with the device root key. MHDR stays in clear.
    pub fn encode_join_accept(&mut self, app_key: &AesKey) -> Result<Vec<u8>> {
        let payload = self
            .join_accept()
            .ok_or_else(|| LoraNsError::InvalidMessageType(self.mtype().to_string()))?;
        let mut buffer = Vec::with_capacity(1 + JOIN_ACCEPT_LEN + MIC_LEN);
        buffer.push(self.mhdr.encode());
        payload.encode(&mut buffer);
        self.mic = crypto::join_mic(app_key, &buffer);
        buffer.extend_from_slice(&self.mic.to_le_bytes());

        let mut ret = Vec::with_capacity(buffer.len());
        ret.push(buffer[0]);
        ret.extend(crypto::ecb_decrypt(app_key, &buffer[1..]));
        Ok(ret)
    }

    /// Device side of the Join-Accept: unwraps and checks the MIC
    pub fn decode_join_accept(app_key: &AesKey, data: &[u8]) -> Result<Self> {
        if data.len() < 1 + JOIN_ACCEPT_LEN + MIC_LEN {
            return Err(LoraNsError::BufferTruncated("join accept".to_string()));
        }
        let mhdr = MHdr::decode(data[0])?;
        if mhdr.mtype != MType::JoinAccept {
            return Err(LoraNsError::InvalidMessageType(mhdr.mtype.to_string()));
        }
        let clear = crypto::ecb_encrypt(app_key, &data[1..]);
        let n = clear.len();
        let payload = JoinAcceptPayload::decode(&clear[..n - MIC_LEN])?;
        let mic = u32::from_le_bytes([clear[n - 4], clear[n - 3], clear[n - 2], clear[n - 1]]);

        let mut signed = Vec::with_capacity(n);
        signed.push(data[0]);
        signed.extend_from_slice(&clear[..n - MIC_LEN]);
        if crypto::join_mic(app_key, &signed) != mic {
            return Err(LoraNsError::InvalidMic);
        }
        Ok(Self {
            mhdr,
            payload: Payload::JoinAccept(payload),
            mic,
        })
    }

    pub fn encode_join_request(&mut self, app_key: &AesKey) -> Result<Vec<u8>> {
        let payload = self
            .join_request()
            .ok_or_else(|| LoraNsError::InvalidMessageType(self.mtype().to_string()))?;
        let mut buffer = Vec::with_capacity(1 + JOIN_REQUEST_LEN + MIC_LEN);
        buffer.push(self.mhdr.encode());
        payload.encode(&mut buffer);
        self.mic = crypto::join_mic(app_key, &buffer);
        buffer.extend_from_slice(&self.mic.to_le_bytes());
        Ok(buffer)
    }

    /// Checks the Join-Request MIC against the raw bytes it was decoded from
    pub fn join_request_mic_valid(&self, app_key: &AesKey, raw: &[u8]) -> bool {
        raw.len() >= MINIMUM_MESSAGE_SIZE
            && crypto::join_mic(app_key, &raw[..raw.len() - MIC_LEN]) == self.mic
    }
}
