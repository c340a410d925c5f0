use crate::error::{LoraNsError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum encoded length of the FOpts field
pub const MAX_FOPTS_LEN: usize = 15;

/// Command identifiers. Requests and answers share the identifier and
/// are told apart by direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Cid {
    LinkCheck = 0x02,
    LinkAdr = 0x03,
    DutyCycle = 0x04,
    RxParamSetup = 0x05,
    DevStatus = 0x06,
    NewChannel = 0x07,
    RxTimingSetup = 0x08,
    PingSlotInfo = 0x10,
    PingSlotChannel = 0x11,
    BeaconTiming = 0x12,
    BeaconFreq = 0x13,
}

impl Cid {
    pub fn from_u8(value: u8) -> Option<Self> {
        let cid = match value {
            0x02 => Cid::LinkCheck,
            0x03 => Cid::LinkAdr,
            0x04 => Cid::DutyCycle,
            0x05 => Cid::RxParamSetup,
            0x06 => Cid::DevStatus,
            0x07 => Cid::NewChannel,
            0x08 => Cid::RxTimingSetup,
            0x10 => Cid::PingSlotInfo,
            0x11 => Cid::PingSlotChannel,
            0x12 => Cid::BeaconTiming,
            0x13 => Cid::BeaconFreq,
            _ => return None,
        };
        Some(cid)
    }

    /// Encoded length including the identifier octet
    pub fn encoded_length(&self, uplink: bool) -> usize {
        match (self, uplink) {
            (Cid::LinkCheck, true) => 1,
            (Cid::LinkCheck, false) => 3,
            (Cid::LinkAdr, true) => 2,
            (Cid::LinkAdr, false) => 5,
            (Cid::DutyCycle, true) => 1,
            (Cid::DutyCycle, false) => 2,
            (Cid::RxParamSetup, true) => 2,
            (Cid::RxParamSetup, false) => 5,
            (Cid::DevStatus, true) => 3,
            (Cid::DevStatus, false) => 1,
            (Cid::NewChannel, true) => 2,
            (Cid::NewChannel, false) => 6,
            (Cid::RxTimingSetup, true) => 1,
            (Cid::RxTimingSetup, false) => 2,
            (Cid::PingSlotInfo, true) => 2,
            (Cid::PingSlotInfo, false) => 1,
            (Cid::PingSlotChannel, true) => 2,
            (Cid::PingSlotChannel, false) => 5,
            (Cid::BeaconTiming, true) => 1,
            (Cid::BeaconTiming, false) => 4,
            (Cid::BeaconFreq, true) => 1,
            (Cid::BeaconFreq, false) => 4,
        }
    }

    pub fn name(&self, uplink: bool) -> &'static str {
        match (self, uplink) {
            (Cid::LinkCheck, true) => "LinkCheckReq",
            (Cid::LinkCheck, false) => "LinkCheckAns",
            (Cid::LinkAdr, true) => "LinkADRAns",
            (Cid::LinkAdr, false) => "LinkADRReq",
            (Cid::DutyCycle, true) => "DutyCycleAns",
            (Cid::DutyCycle, false) => "DutyCycleReq",
            (Cid::RxParamSetup, true) => "RXParamSetupAns",
            (Cid::RxParamSetup, false) => "RXParamSetupReq",
            (Cid::DevStatus, true) => "DevStatusAns",
            (Cid::DevStatus, false) => "DevStatusReq",
            (Cid::NewChannel, true) => "NewChannelAns",
            (Cid::NewChannel, false) => "NewChannelReq",
            (Cid::RxTimingSetup, true) => "RXTimingSetupAns",
            (Cid::RxTimingSetup, false) => "RXTimingSetupReq",
            (Cid::PingSlotInfo, true) => "PingSlotInfoReq",
            (Cid::PingSlotInfo, false) => "PingSlotInfoAns",
            (Cid::PingSlotChannel, true) => "PingSlotFreqAns",
            (Cid::PingSlotChannel, false) => "PingSlotChannelReq",
            (Cid::BeaconTiming, true) => "BeaconTimingReq",
            (Cid::BeaconTiming, false) => "BeaconTimingAns",
            (Cid::BeaconFreq, true) => "BeaconFreqAns",
            (Cid::BeaconFreq, false) => "BeaconFreqReq",
        }
    }
}

/// A single MAC command with its raw (identifier-less) body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacCommand {
    cid: Cid,
    uplink: bool,
    body: Vec<u8>,
}

impl MacCommand {
    pub fn new(cid: Cid, uplink: bool, body: Vec<u8>) -> Result<Self> {
        let expected = cid.encoded_length(uplink) - 1;
        if body.len() != expected {
            return Err(LoraNsError::MacCommandError(format!(
                "{} takes {} bytes, got {}",
                cid.name(uplink),
                expected,
                body.len()
            )));
        }
        Ok(Self { cid, uplink, body })
    }

    /// Command with an all-zero body
    pub fn empty(cid: Cid, uplink: bool) -> Self {
        Self {
            cid,
            uplink,
            body: vec![0; cid.encoded_length(uplink) - 1],
        }
    }

    pub fn link_check_ans(margin: u8, gw_cnt: u8) -> Self {
        Self {
            cid: Cid::LinkCheck,
            uplink: false,
            body: vec![margin, gw_cnt],
        }
    }

    pub fn dev_status_req() -> Self {
        Self::empty(Cid::DevStatus, false)
    }

    pub fn duty_cycle_req(max_duty_cycle: u8) -> Self {
        Self {
            cid: Cid::DutyCycle,
            uplink: false,
            body: vec![max_duty_cycle & 0x0F],
        }
    }

    pub fn rx_timing_setup_req(delay: u8) -> Self {
        Self {
            cid: Cid::RxTimingSetup,
            uplink: false,
            body: vec![delay & 0x0F],
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn is_uplink(&self) -> bool {
        self.uplink
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Length on the wire including the identifier
    pub fn encoded_length(&self) -> usize {
        self.body.len() + 1
    }

    pub fn name(&self) -> &'static str {
        self.cid.name(self.uplink)
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.cid as u8);
        buffer.extend_from_slice(&self.body);
    }
}

impl fmt::Display for MacCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), hex::encode(&self.body))
    }
}

/// Set of MAC commands bounded by an encoded length. At most one command
/// per identifier; iteration is in identifier order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacCommandSet {
    commands: BTreeMap<Cid, MacCommand>,
    max_length: usize,
    uplink: bool,
}

impl MacCommandSet {
    pub fn new(uplink: bool, max_length: usize) -> Self {
        Self {
            commands: BTreeMap::new(),
            max_length,
            uplink,
        }
    }

    pub fn new_fopts(uplink: bool) -> Self {
        Self::new(uplink, MAX_FOPTS_LEN)
    }

    /// Fails if the command goes the wrong way or would overflow the set
    pub fn add(&mut self, cmd: MacCommand) -> Result<()> {
        if cmd.uplink != self.uplink {
            return Err(LoraNsError::MacCommandError(format!(
                "{} has the wrong direction for this set",
                cmd.name()
            )));
        }
        let replaced = self.commands.get(&cmd.cid).map_or(0, MacCommand::encoded_length);
        let new_length = self.encoded_length() - replaced + cmd.encoded_length();
        if new_length > self.max_length {
            return Err(LoraNsError::MacCommandError(format!(
                "adding {} gives length {} (max is {})",
                cmd.name(),
                new_length,
                self.max_length
            )));
        }
        self.commands.insert(cmd.cid, cmd);
        Ok(())
    }

    pub fn contains(&self, cid: Cid) -> bool {
        self.commands.contains_key(&cid)
    }

    pub fn remove(&mut self, cid: Cid) -> Option<MacCommand> {
        self.commands.remove(&cid)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacCommand> {
        self.commands.values()
    }

    pub fn encoded_length(&self) -> usize {
        self.commands.values().map(MacCommand::encoded_length).sum()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn is_uplink(&self) -> bool {
        self.uplink
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        for cmd in self.commands.values() {
            cmd.encode(buffer);
        }
    }

    /// Decodes commands from `octets`. Stops quietly at an unknown identifier,
    /// a truncated command or when the set is full.
    pub fn decode(octets: &[u8], uplink: bool, max_length: usize) -> Self {
        let mut set = Self::new(uplink, max_length);
        let mut pos = 0;
        while pos < octets.len() {
            let Some(cid) = Cid::from_u8(octets[pos]) else {
                break;
            };
            let length = cid.encoded_length(uplink);
            if pos + length > octets.len() || set.encoded_length() + length > max_length {
                break;
            }
            let cmd = MacCommand {
                cid,
                uplink,
                body: octets[pos + 1..pos + length].to_vec(),
            };
            if set.add(cmd).is_err() {
                break;
            }
            pos += length;
        }
        set
    }
}
