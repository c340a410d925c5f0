//! Per-device mailbox for downlink content. Application payload and MAC
//! commands are merged here and cut into frames that fit the radio.

use crate::error::{LoraNsError, Result};
use crate::model::device::Device;
use crate::model::frames::FrameContext;
use crate::model::lorawan::Eui;
use crate::protocol::{
    FCtrl, JoinAcceptPayload, MHdr, MType, MacCommand, MacCommandSet, Payload, PhyPayload,
    MAX_MAC_COMMAND_PAYLOAD,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

/// Everything owed to one device
#[derive(Debug, Clone)]
struct FrameOutput {
    mtype: MType,
    ack: bool,
    port: u8,
    payload: Vec<u8>,
    mac_commands: MacCommandSet,
    join_accept: Option<JoinAcceptPayload>,
}

impl FrameOutput {
    fn new(mtype: MType) -> Self {
        Self {
            mtype,
            ack: false,
            port: 0,
            payload: Vec::new(),
            mac_commands: MacCommandSet::new(false, MAX_MAC_COMMAND_PAYLOAD),
            join_accept: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameOutputBuffer {
    frames: Mutex<HashMap<Eui, FrameOutput>>,
}

impl FrameOutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a MAC command for the next frame
    pub fn add_mac_command(&self, dev_eui: Eui, cmd: MacCommand) -> Result<()> {
        let mut frames = self.frames.lock();
        let output = frames
            .entry(dev_eui)
            .or_insert_with(|| FrameOutput::new(MType::UnconfirmedDataDown));
        output.mac_commands.add(cmd).map_err(|e| {
            warn!(dev_eui = %dev_eui, "Couldn't queue MAC command: {}", e);
            e
        })
    }

    /// Replaces any queued payload
    pub fn set_payload(&self, dev_eui: Eui, payload: Vec<u8>, port: u8, ack: bool) {
        let mut frames = self.frames.lock();
        let output = frames
            .entry(dev_eui)
            .or_insert_with(|| FrameOutput::new(MType::UnconfirmedDataDown));
        output.payload = payload;
        output.port = port;
        output.mtype = if ack {
            MType::ConfirmedDataDown
        } else {
            MType::UnconfirmedDataDown
        };
    }

    /// The next frame for the device is a Join-Accept
    pub fn set_join_accept_payload(&self, dev_eui: Eui, payload: JoinAcceptPayload) {
        let mut frames = self.frames.lock();
        let output = frames
            .entry(dev_eui)
            .or_insert_with(|| FrameOutput::new(MType::JoinAccept));
        output.join_accept = Some(payload);
        output.port = 0;
        output.mtype = MType::JoinAccept;
    }

    /// With the flag set a frame goes out even when there's nothing else to send
    pub fn set_message_ack_flag(&self, dev_eui: Eui, ack: bool) {
        let mut frames = self.frames.lock();
        frames
            .entry(dev_eui)
            .or_insert_with(|| FrameOutput::new(MType::UnconfirmedDataDown))
            .ack = ack;
    }

    pub fn contains(&self, dev_eui: &Eui) -> bool {
        self.frames.lock().contains_key(dev_eui)
    }

    /// Takes the next frame for the device. Content that doesn't fit stays
    /// queued and the frame gets FPending. Fails with `NothingToSend` (and
    /// forgets the device) when nothing is owed.
    pub fn get_phy_payload_for_device(
        &self,
        device: &Device,
        context: &FrameContext,
    ) -> Result<PhyPayload> {
        let mut frames = self.frames.lock();
        let Some(output) = frames.get_mut(&device.dev_eui) else {
            return Err(LoraNsError::NothingToSend(device.dev_eui.to_string()));
        };

        let is_join_accept = output.mtype == MType::JoinAccept;
        if output.payload.is_empty()
            && output.mac_commands.is_empty()
            && !is_join_accept
            && !output.ack
        {
            frames.remove(&device.dev_eui);
            return Err(LoraNsError::NothingToSend(device.dev_eui.to_string()));
        }

        let ack = std::mem::take(&mut output.ack);

        if is_join_accept {
            let join_accept = output.join_accept.take().unwrap_or_default();
            output.mtype = MType::UnconfirmedDataDown;
            return Ok(PhyPayload {
                mhdr: MHdr::new(MType::JoinAccept),
                payload: Payload::JoinAccept(join_accept),
                mic: 0,
            });
        }

        let mut ret = PhyPayload::new(output.mtype);
        let Some(mac_payload) = ret.mac_payload_mut() else {
            return Err(LoraNsError::InvalidMessageType(output.mtype.to_string()));
        };
        mac_payload.fhdr.dev_addr = device.dev_addr;
        mac_payload.fhdr.fctrl = FCtrl {
            ack,
            ..FCtrl::default()
        };
        mac_payload.fport = output.port;

        if !output.payload.is_empty() {
            let radio = &context.packet.radio;
            let sizes = radio.band.maximum_payload(&radio.data_rate)?;
            let max = if output.mac_commands.is_empty() {
                sizes.without_fopts
            } else {
                sizes.with_fopts
            };
            let max = usize::from(max);
            if output.payload.len() > max {
                let rest = output.payload.split_off(max);
                mac_payload.frm_payload = std::mem::replace(&mut output.payload, rest);
            } else {
                mac_payload.frm_payload = std::mem::take(&mut output.payload);
            }

            // Piggyback as many commands as FOpts takes
            let queued: Vec<MacCommand> = output.mac_commands.iter().cloned().collect();
            for cmd in queued {
                let cid = cmd.cid();
                if mac_payload.fhdr.fopts.add(cmd).is_err() {
                    break;
                }
                output.mac_commands.remove(cid);
            }
        } else {
            mac_payload.mac_commands = std::mem::replace(
                &mut output.mac_commands,
                MacCommandSet::new(false, MAX_MAC_COMMAND_PAYLOAD),
            );
        }

        if output.payload.is_empty() {
            output.mtype = MType::UnconfirmedDataDown;
        }
        if !output.payload.is_empty() || !output.mac_commands.is_empty() {
            mac_payload.fhdr.fctrl.f_pending = true;
        }

        Ok(ret)
    }
}
