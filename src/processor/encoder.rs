use crate::model::frames::{GatewayPacket, LoRaMessage};
use crate::model::lorawan::Eui;
use crate::protocol::MType;
use crate::server::{Counter, ServerContext};
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Renders downlink frames to bytes and hands them to the transport
pub struct Encoder {
    context: ServerContext,
}

impl Encoder {
    pub fn new(context: ServerContext) -> Self {
        Self { context }
    }

    pub fn start(
        self,
        mut input: mpsc::Receiver<LoRaMessage>,
        output: mpsc::Sender<GatewayPacket>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = input.recv().await {
                let context = self.context.clone();
                let output = output.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let Some(packet) = encode(&context, msg) else {
                        return;
                    };
                    if output.send(packet).await.is_err() {
                        debug!("Gateway output closed");
                        return;
                    }
                    context.metrics.increment(Counter::Encoder);
                    context.metrics.observe(Counter::Encoder, started.elapsed());
                });
            }
            debug!("Encoder input closed");
        })
    }
}

fn encode(context: &ServerContext, mut msg: LoRaMessage) -> Option<GatewayPacket> {
    let Some(mut device) = msg.context.device.take() else {
        warn!("Downlink without a device, dropping");
        return None;
    };
    let band = context.band.configuration();

    let (buffer, rx1_delay) = match msg.payload.mtype() {
        MType::JoinAccept => {
            device.fcnt_up = 0;
            device.fcnt_dn = 0;
            if let Err(e) = context.storage.devices.update_state(&device) {
                warn!(dev_eui = %device.dev_eui, "Unable to reset frame counters: {}", e);
                return None;
            }
            match msg.payload.encode_join_accept(&device.app_key) {
                Ok(b) => (b, band.join_accept_delay1),
                Err(e) => {
                    error!(dev_eui = %device.dev_eui, "Unable to encode Join-Accept: {}", e);
                    return None;
                }
            }
        }
        MType::UnconfirmedDataDown | MType::ConfirmedDataDown => {
            let Some(mac_payload) = msg.payload.mac_payload_mut() else {
                return None;
            };
            mac_payload.fhdr.fcnt = device.fcnt_dn;
            let carries_payload = !mac_payload.frm_payload.is_empty();
            let buffer = match msg
                .payload
                .encode_message(&device.nwk_skey, &device.app_skey)
            {
                Ok(b) => b,
                Err(e) => {
                    error!(dev_eui = %device.dev_eui, "Unable to encode downlink: {}", e);
                    return None;
                }
            };
            if carries_payload {
                mark_downstream_sent(context, &device.dev_eui);
            }
            device.fcnt_dn = device.fcnt_dn.wrapping_add(1);
            if let Err(e) = context.storage.devices.update_state(&device) {
                warn!(dev_eui = %device.dev_eui, "Unable to update downlink counter: {}", e);
            }
            (buffer, band.receive_delay1)
        }
        other => {
            warn!(dev_eui = %device.dev_eui, "Can't encode {} as a downlink, dropping", other);
            return None;
        }
    };

    let mut packet = msg.context.packet;
    packet.raw = buffer;
    packet.radio.rx1_delay = rx1_delay;
    packet.deadline = Duration::from_secs(u64::from(rx1_delay));
    Some(packet)
}

fn mark_downstream_sent(context: &ServerContext, dev_eui: &Eui) {
    let message = match context.storage.data.get_downstream(dev_eui) {
        Ok(m) => m,
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            warn!(dev_eui = %dev_eui, "Unable to read downstream message: {}", e);
            return;
        }
    };
    if message.is_complete() {
        return;
    }
    match context
        .storage
        .data
        .update_downstream(dev_eui, Some(Utc::now()), message.ack_time)
    {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(dev_eui = %dev_eui, "Unable to mark downstream as sent: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::device::{Device, DeviceState, DownstreamMessage};
    use crate::model::frames::{FrameContext, GatewayContext, RadioContext};
    use crate::model::lorawan::{AesKey, DevAddr};
    use crate::protocol::{DlSettings, JoinAcceptPayload, Payload, PhyPayload};
    use crate::server::InMemoryMetrics;
    use crate::storage::Storage;
    use std::sync::Arc;

    fn device() -> Device {
        Device {
            dev_eui: Eui::from_u64(0x10),
            app_eui: Eui::from_u64(1),
            dev_addr: DevAddr(0x2601_0001),
            app_key: "2B7E151628AED2A6ABF7158809CF4F3C".parse().unwrap(),
            nwk_skey: AesKey::generate(),
            app_skey: AesKey::generate(),
            state: DeviceState::Abp,
            fcnt_up: 4,
            fcnt_dn: 9,
            relaxed_counter: false,
            key_warning: false,
            dev_nonce_history: vec![],
        }
    }

    fn setup() -> (ServerContext, Device) {
        let ctx = ServerContext::new(
            Config::default(),
            Storage::in_memory(),
            Arc::new(InMemoryMetrics::new()),
        );
        let d = device();
        ctx.storage.devices.put(d.clone()).unwrap();
        (ctx, d)
    }

    fn message(ctx: &ServerContext, device: &Device, payload: PhyPayload) -> LoRaMessage {
        let radio = RadioContext::new(ctx.band.clone());
        let mut frame = FrameContext::new(GatewayPacket::new(vec![0xFF], radio, GatewayContext::default()));
        frame.device = Some(device.clone());
        LoRaMessage {
            payload,
            context: frame,
        }
    }

    #[test]
    fn test_data_frame_uses_and_advances_downlink_counter() {
        let (ctx, d) = setup();
        let mut phy = PhyPayload::new(MType::UnconfirmedDataDown);
        let mp = phy.mac_payload_mut().unwrap();
        mp.fhdr.dev_addr = d.dev_addr;
        mp.fport = 1;
        mp.frm_payload = vec![1, 2, 3];
        ctx.storage
            .data
            .put_downstream(DownstreamMessage::new(d.dev_eui, 1, vec![1, 2, 3], false))
            .unwrap();

        let packet = encode(&ctx, message(&ctx, &d, phy)).unwrap();
        assert_eq!(packet.radio.rx1_delay, 1);
        assert_eq!(packet.deadline, Duration::from_secs(1));

        let decoded = PhyPayload::decode(&packet.raw).unwrap();
        assert_eq!(decoded.mac_payload().unwrap().fhdr.fcnt, 9);
        let stored = ctx.storage.devices.get_by_eui(&d.dev_eui).unwrap();
        assert_eq!(stored.fcnt_dn, 10);

        let downstream = ctx.storage.data.get_downstream(&d.dev_eui).unwrap();
        assert!(downstream.sent.is_some());
        assert!(downstream.is_complete());
    }

    #[test]
    fn test_join_accept_resets_counters() {
        let (ctx, d) = setup();
        let ja = JoinAcceptPayload {
            app_nonce: [1, 2, 3],
            net_id: 0x13,
            dev_addr: d.dev_addr,
            dl_settings: DlSettings::default(),
            rx_delay: 1,
        };
        let phy = PhyPayload {
            payload: Payload::JoinAccept(ja),
            ..PhyPayload::new(MType::JoinAccept)
        };

        let packet = encode(&ctx, message(&ctx, &d, phy)).unwrap();
        assert_eq!(packet.radio.rx1_delay, 5);
        assert_eq!(packet.deadline, Duration::from_secs(5));
        let decoded = PhyPayload::decode_join_accept(&d.app_key, &packet.raw).unwrap();
        assert_eq!(decoded.join_accept(), Some(&ja));

        let stored = ctx.storage.devices.get_by_eui(&d.dev_eui).unwrap();
        assert_eq!((stored.fcnt_up, stored.fcnt_dn), (0, 0));
    }

    #[test]
    fn test_uplink_types_are_dropped() {
        let (ctx, d) = setup();
        let phy = PhyPayload::new(MType::ConfirmedDataUp);
        assert!(encode(&ctx, message(&ctx, &d, phy)).is_none());
        assert_eq!(ctx.storage.devices.get_by_eui(&d.dev_eui).unwrap().fcnt_dn, 9);
    }
}
