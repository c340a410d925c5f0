//! Device resolution, MIC and counter checks, payload decryption and
//! delivery to application subscribers. Join-Requests are handed to
//! [`super::join`].

use super::join;
use crate::model::device::{Application, Device, DeviceData, DownstreamState};
use crate::model::frames::{LoRaMessage, PayloadMessage};
use crate::protocol::{MType, PhyPayload};
use crate::server::{Counter, ServerContext};
use chrono::Utc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MIC_LEN: usize = 4;

pub struct Decrypter {
    context: ServerContext,
}

impl Decrypter {
    pub fn new(context: ServerContext) -> Self {
        Self { context }
    }

    pub fn start(
        self,
        mut input: mpsc::Receiver<LoRaMessage>,
        output: mpsc::Sender<LoRaMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = input.recv().await {
                let context = self.context.clone();
                let output = output.clone();
                match msg.payload.mtype() {
                    MType::JoinRequest => {
                        tokio::spawn(async move {
                            join::process_join_request(&context, msg, &output).await;
                        });
                    }
                    MType::ConfirmedDataUp | MType::UnconfirmedDataUp => {
                        tokio::spawn(async move {
                            process_data_frame(&context, msg, &output).await;
                        });
                    }
                    other => {
                        info!("Dropping {} frame received from a gateway", other);
                    }
                }
            }
            debug!("Decrypter input closed");
        })
    }
}

/// Devices sharing the frame's DevAddr whose network key reproduces its MIC
fn matching_devices(payload: &PhyPayload, raw: &[u8], candidates: Vec<Device>) -> Vec<Device> {
    if raw.len() < MIC_LEN {
        return Vec::new();
    }
    let signed = &raw[..raw.len() - MIC_LEN];
    candidates
        .into_iter()
        .filter(|device| {
            payload
                .calculate_mic(&device.nwk_skey, signed)
                .map(|mic| mic == payload.mic)
                .unwrap_or(false)
        })
        .collect()
}

async fn process_data_frame(
    context: &ServerContext,
    msg: LoRaMessage,
    output: &mpsc::Sender<LoRaMessage>,
) {
    let started = Instant::now();
    let Some(mac_payload) = msg.payload.mac_payload() else {
        return;
    };
    let dev_addr = mac_payload.fhdr.dev_addr;

    let candidates = match context.storage.devices.get_by_dev_addr(dev_addr) {
        Ok(devices) => devices,
        Err(e) => {
            warn!(dev_addr = %dev_addr, "Unable to look up devices: {}", e);
            return;
        }
    };
    if candidates.is_empty() {
        info!(dev_addr = %dev_addr, "No devices with this DevAddr");
        return;
    }

    let candidate_count = candidates.len();
    let matched = matching_devices(&msg.payload, &msg.context.packet.raw, candidates);
    if matched.is_empty() {
        info!(
            dev_addr = %dev_addr,
            "MIC check failed for all {} candidate devices", candidate_count
        );
        context.metrics.increment(Counter::MicFailed);
        return;
    }

    let key_warning = matched.len() > 1;
    if key_warning {
        warn!(
            dev_addr = %dev_addr,
            "{} devices share DevAddr and keys", matched.len()
        );
    }

    for device in matched {
        process_matched_device(context, &msg, device, key_warning, output).await;
    }
    context.metrics.observe(Counter::Decrypter, started.elapsed());
}

/// Counter policy, state update and delivery for one device whose keys
/// verified the frame. Failures here only affect this device.
async fn process_matched_device(
    context: &ServerContext,
    msg: &LoRaMessage,
    mut device: Device,
    key_warning: bool,
    output: &mpsc::Sender<LoRaMessage>,
) {
    let Some(mac_payload) = msg.payload.mac_payload() else {
        return;
    };
    let fcnt = mac_payload.fhdr.fcnt;
    let uplink_ack = mac_payload.fhdr.fctrl.ack;
    let confirmed = msg.payload.mtype() == MType::ConfirmedDataUp;

    if device.fcnt_up > fcnt {
        if !device.relaxed_counter {
            info!(
                dev_eui = %device.dev_eui,
                "Frame counter {} is behind stored {}, dropping", fcnt, device.fcnt_up
            );
            context.metrics.increment(Counter::CounterFailed);
            return;
        }
        debug!(
            dev_eui = %device.dev_eui,
            "Frame counter mismatch for relaxed device: {} (stored {})", fcnt, device.fcnt_up
        );
    }

    context.metrics.increment(if confirmed {
        Counter::ConfirmedUp
    } else {
        Counter::UnconfirmedUp
    });

    let mut state_changed = false;
    if key_warning && !device.key_warning {
        device.key_warning = true;
        state_changed = true;
    }
    if fcnt >= device.fcnt_up {
        device.fcnt_up = fcnt.wrapping_add(1);
        state_changed = true;
    }
    if state_changed {
        if let Err(e) = context.storage.devices.update_state(&device) {
            warn!(dev_eui = %device.dev_eui, "Unable to update frame counters: {}", e);
        }
    }

    let mut payload = msg.payload.clone();
    payload.decrypt(&device.nwk_skey, &device.app_skey);

    let Some(application) = deliver(context, &device, &payload, msg) else {
        return;
    };

    if confirmed {
        context.frame_output.set_message_ack_flag(device.dev_eui, true);
    }
    queue_downstream(context, &device, uplink_ack);

    let mut frame = msg.context.clone();
    frame.device = Some(device.clone());
    frame.application = Some(application.clone());

    let (port, frm_payload, mut mac_commands) = match payload.mac_payload() {
        Some(mp) => (
            mp.fport,
            mp.frm_payload.clone(),
            mp.fhdr.fopts.iter().cloned().collect::<Vec<_>>(),
        ),
        None => (0, Vec::new(), Vec::new()),
    };
    if let Some(mp) = payload.mac_payload() {
        mac_commands.extend(mp.mac_commands.iter().cloned());
    }

    if output
        .send(LoRaMessage {
            payload,
            context: frame.clone(),
        })
        .await
        .is_err()
    {
        debug!("MAC processor input closed");
    }

    context.app_router.publish(
        application.app_eui,
        PayloadMessage {
            payload: frm_payload,
            port,
            device,
            application,
            mac_commands,
            context: frame,
        },
    );
    context.metrics.increment(Counter::Decrypter);
}

/// Stores the uplink and resolves the owning application
fn deliver(
    context: &ServerContext,
    device: &Device,
    payload: &PhyPayload,
    msg: &LoRaMessage,
) -> Option<Application> {
    let packet = &msg.context.packet;
    let data = DeviceData {
        dev_eui: device.dev_eui,
        timestamp: Utc::now(),
        data: payload
            .mac_payload()
            .map(|mp| mp.frm_payload.clone())
            .unwrap_or_default(),
        gateway_eui: packet.gateway.gateway_eui,
        rssi: packet.radio.rssi,
        snr: packet.radio.snr,
        frequency: packet.radio.frequency,
        data_rate: packet.radio.data_rate.clone(),
        dev_addr: device.dev_addr,
    };
    if let Err(e) = context.storage.data.put(data) {
        warn!(dev_eui = %device.dev_eui, "Unable to store device data: {}", e);
        return None;
    }

    match context.storage.applications.get_by_eui(&device.app_eui) {
        Ok(app) => Some(app),
        Err(e) => {
            warn!(
                dev_eui = %device.dev_eui,
                "Unable to look up application {}: {}", device.app_eui, e
            );
            None
        }
    }
}

/// Completes an acknowledged downstream message or (re)queues one that
/// is still owed
fn queue_downstream(context: &ServerContext, device: &Device, uplink_ack: bool) {
    let mut message = match context.storage.data.get_downstream(&device.dev_eui) {
        Ok(m) => m,
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            warn!(dev_eui = %device.dev_eui, "Unable to read downstream message: {}", e);
            return;
        }
    };

    if uplink_ack && message.ack && message.state() == DownstreamState::Sent {
        let now = Utc::now();
        match context
            .storage
            .data
            .update_downstream(&device.dev_eui, message.sent, Some(now))
        {
            Ok(()) => message.ack_time = Some(now),
            Err(e) => warn!(dev_eui = %device.dev_eui, "Unable to mark downstream as acknowledged: {}", e),
        }
    }

    if !message.is_complete() {
        context
            .frame_output
            .set_payload(device.dev_eui, message.payload, message.port, message.ack);
    }
}
