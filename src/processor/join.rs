//! OTAA join handshake

use crate::model::device::DeviceState;
use crate::model::frames::LoRaMessage;
use crate::model::lorawan::DevAddr;
use crate::protocol::crypto::derive_session_keys;
use crate::protocol::JoinAcceptPayload;
use crate::server::{Counter, ServerContext};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Validates a Join-Request, rolls the session keys and queues the
/// Join-Accept. The frame goes straight to `output` (the MAC processor
/// input) carrying the joined device.
pub(super) async fn process_join_request(
    context: &ServerContext,
    msg: LoRaMessage,
    output: &mpsc::Sender<LoRaMessage>,
) {
    context.metrics.increment(Counter::JoinRequest);
    let Some(request) = msg.payload.join_request().copied() else {
        return;
    };

    let mut device = match context.storage.devices.get_by_eui(&request.dev_eui) {
        Ok(d) => d,
        Err(e) => {
            info!(dev_eui = %request.dev_eui, "Join-Request from unknown device: {}", e);
            return;
        }
    };
    if device.app_eui != request.app_eui {
        info!(
            dev_eui = %device.dev_eui,
            "Join-Request AppEUI {} doesn't match device AppEUI {}", request.app_eui, device.app_eui
        );
        return;
    }
    if !msg
        .payload
        .join_request_mic_valid(&device.app_key, &msg.context.packet.raw)
    {
        info!(dev_eui = %device.dev_eui, "Join-Request MIC check failed");
        context.metrics.increment(Counter::MicFailed);
        return;
    }
    if device.has_dev_nonce(request.dev_nonce) {
        info!(
            dev_eui = %device.dev_eui,
            "DevNonce {:#06x} already used, rejecting Join-Request", request.dev_nonce
        );
        return;
    }
    let application = match context.storage.applications.get_by_eui(&device.app_eui) {
        Ok(app) => app,
        Err(e) => {
            info!(
                dev_eui = %device.dev_eui,
                "Unable to look up application {}: {}", device.app_eui, e
            );
            return;
        }
    };

    if let Err(e) = context
        .storage
        .devices
        .add_dev_nonce(&device, request.dev_nonce)
    {
        warn!(dev_eui = %device.dev_eui, "Unable to store DevNonce: {}", e);
    }
    device.dev_nonce_history.push(request.dev_nonce);

    let net_id = context.config.server.network_id;
    let app_nonce: [u8; 3] = rand::random();
    let (nwk_skey, app_skey) =
        derive_session_keys(&device.app_key, app_nonce, net_id, request.dev_nonce);
    device.nwk_skey = nwk_skey;
    device.app_skey = app_skey;
    device.fcnt_up = 0;
    device.fcnt_dn = 0;
    device.state = DeviceState::Otaa;
    if device.dev_addr.to_u32() == 0 {
        // NwkID is the low 7 bits of the NetID
        device.dev_addr = DevAddr::new((net_id & 0x7F) as u8, rand::random());
        debug!(dev_eui = %device.dev_eui, "Assigned DevAddr {}", device.dev_addr);
    }

    if let Err(e) = context.storage.devices.update(&device) {
        error!(dev_eui = %device.dev_eui, "Unable to store joined device: {}", e);
        return;
    }

    context.frame_output.set_join_accept_payload(
        device.dev_eui,
        JoinAcceptPayload {
            app_nonce,
            net_id,
            dev_addr: device.dev_addr,
            dl_settings: context.band.otaa_dl_settings(),
            rx_delay: context.band.otaa_rx_delay(),
        },
    );

    let dev_eui = device.dev_eui;
    let mut frame = msg.context;
    frame.device = Some(device);
    frame.application = Some(application);
    // Plain send: blocks while the MAC processor is busy, and parks this
    // task on shutdown if the receiver is never drained
    if output
        .send(LoRaMessage {
            payload: msg.payload,
            context: frame,
        })
        .await
        .is_err()
    {
        debug!(dev_eui = %dev_eui, "MAC processor input closed, Join-Accept dropped");
        return;
    }
    info!(dev_eui = %dev_eui, "Join-Request accepted");
    context.metrics.increment(Counter::JoinAccept);
}
