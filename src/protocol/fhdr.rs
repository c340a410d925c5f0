use super::mac::{MacCommandSet, MAX_FOPTS_LEN};
use crate::error::{LoraNsError, Result};
use crate::model::lorawan::DevAddr;

/// Frame control octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    /// FPending on downlink, Class B indicator on uplink
    pub f_pending: bool,
    pub f_opts_len: u8,
}

impl FCtrl {
    pub fn decode(octet: u8) -> Self {
        Self {
            adr: octet & 0x80 != 0,
            adr_ack_req: octet & 0x40 != 0,
            ack: octet & 0x20 != 0,
            f_pending: octet & 0x10 != 0,
            f_opts_len: octet & 0x0F,
        }
    }

    pub fn encode(&self) -> Result<u8> {
        if usize::from(self.f_opts_len) > MAX_FOPTS_LEN {
            return Err(LoraNsError::ParameterOutOfRange(format!(
                "FOptsLen {}",
                self.f_opts_len
            )));
        }
        let mut octet = self.f_opts_len & 0x0F;
        if self.adr {
            octet |= 0x80;
        }
        if self.adr_ack_req {
            octet |= 0x40;
        }
        if self.ack {
            octet |= 0x20;
        }
        if self.f_pending {
            octet |= 0x10;
        }
        Ok(octet)
    }

    pub fn class_b(&self) -> bool {
        self.f_pending
    }
}

/// Frame header: DevAddr, FCtrl, FCnt and piggybacked MAC commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FHdr {
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub fopts: MacCommandSet,
}

impl FHdr {
    pub fn new(uplink: bool) -> Self {
        Self {
            dev_addr: DevAddr::default(),
            fctrl: FCtrl::default(),
            fcnt: 0,
            fopts: MacCommandSet::new_fopts(uplink),
        }
    }

    /// Decodes at `pos`, advancing it past the header including all FOpts bytes
    pub fn decode(octets: &[u8], pos: &mut usize, uplink: bool) -> Result<Self> {
        if octets.len() < *pos + 7 {
            return Err(LoraNsError::BufferTruncated("frame header".to_string()));
        }
        let p = *pos;
        let dev_addr = DevAddr(u32::from_le_bytes([
            octets[p],
            octets[p + 1],
            octets[p + 2],
            octets[p + 3],
        ]));
        let fctrl = FCtrl::decode(octets[p + 4]);
        let fcnt = u16::from_le_bytes([octets[p + 5], octets[p + 6]]);
        *pos += 7;

        let opts_len = usize::from(fctrl.f_opts_len);
        let fopts = if opts_len > 0 {
            if octets.len() < *pos + opts_len {
                return Err(LoraNsError::BufferTruncated("FOpts".to_string()));
            }
            let set = MacCommandSet::decode(&octets[*pos..*pos + opts_len], uplink, MAX_FOPTS_LEN);
            // unknown commands are skipped along with the rest of the field
            *pos += opts_len;
            set
        } else {
            MacCommandSet::new_fopts(uplink)
        };

        Ok(Self {
            dev_addr,
            fctrl,
            fcnt,
            fopts,
        })
    }

    /// FOptsLen is taken from the command set
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        buffer.extend_from_slice(&self.dev_addr.to_u32().to_le_bytes());
        let mut fctrl = self.fctrl;
        fctrl.f_opts_len = self.fopts.encoded_length() as u8;
        buffer.push(fctrl.encode()?);
        buffer.extend_from_slice(&self.fcnt.to_le_bytes());
        self.fopts.encode(buffer);
        Ok(())
    }
}
