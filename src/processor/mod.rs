//! Uplink-to-downlink packet path:
//! decoder -> decrypter (+ join) -> MAC processor -> scheduler -> encoder
//!
//! Every stage reads from one channel and writes to the next. Closing the
//! pipeline input drains each stage in turn and finally closes the output.

pub mod decoder;
pub mod decrypter;
pub mod encoder;
mod join;
pub mod mac_processor;
pub mod scheduler;

use crate::model::frames::GatewayPacket;
use crate::server::{ServerContext, CHANNEL_CAPACITY};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use decoder::Decoder;
pub use decrypter::Decrypter;
pub use encoder::Encoder;
pub use mac_processor::MacProcessor;
pub use scheduler::Scheduler;

pub struct Pipeline {
    context: ServerContext,
}

pub struct PipelineHandle {
    stages: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    pub fn new(context: ServerContext) -> Self {
        Self { context }
    }

    /// Wires the stages between a transport's receive and send channels
    pub fn start(
        self,
        input: mpsc::Receiver<GatewayPacket>,
        output: mpsc::Sender<GatewayPacket>,
    ) -> PipelineHandle {
        let (decoded_tx, decoded_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (decrypted_tx, decrypted_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (mac_tx, mac_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (scheduled_tx, scheduled_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let stages = vec![
            (
                "decoder",
                Decoder::new(self.context.clone()).start(input, decoded_tx),
            ),
            (
                "decrypter",
                Decrypter::new(self.context.clone()).start(decoded_rx, decrypted_tx),
            ),
            (
                "mac_processor",
                MacProcessor::new(self.context.clone()).start(decrypted_rx, mac_tx),
            ),
            (
                "scheduler",
                Scheduler::new(self.context.clone()).start(mac_rx, scheduled_tx),
            ),
            (
                "encoder",
                Encoder::new(self.context).start(scheduled_rx, output),
            ),
        ];
        info!("Packet pipeline started");
        PipelineHandle { stages }
    }
}

impl PipelineHandle {
    /// Waits for every stage loop to finish
    pub async fn join(self) {
        for (name, handle) in self.stages {
            if let Err(e) = handle.await {
                error!("Pipeline stage {} failed: {}", name, e);
            }
        }
        info!("Packet pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::device::{Application, Device, DeviceState, DownstreamMessage};
    use crate::model::frames::{GatewayContext, RadioContext};
    use crate::model::lorawan::{AesKey, DevAddr, Eui};
    use crate::protocol::crypto::derive_session_keys;
    use crate::protocol::{JoinRequestPayload, MType, Payload, PhyPayload};
    use crate::server::{Counter, InMemoryMetrics};
    use crate::storage::Storage;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const NETWORK_ID: u32 = 0x13;
    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(300);

    struct Harness {
        ctx: ServerContext,
        metrics: Arc<InMemoryMetrics>,
        input: mpsc::Sender<GatewayPacket>,
        output: mpsc::Receiver<GatewayPacket>,
        handle: PipelineHandle,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = Config::default();
            config.server.rx_delay = Duration::from_millis(20);
            config.server.network_id = NETWORK_ID;
            let metrics = Arc::new(InMemoryMetrics::new());
            let ctx = ServerContext::new(config, Storage::in_memory(), metrics.clone());
            let (input, pipeline_rx) = mpsc::channel(CHANNEL_CAPACITY);
            let (pipeline_tx, output) = mpsc::channel(CHANNEL_CAPACITY);
            let handle = Pipeline::new(ctx.clone()).start(pipeline_rx, pipeline_tx);
            Self {
                ctx,
                metrics,
                input,
                output,
                handle,
            }
        }

        fn add_application(&self, app_eui: Eui) {
            self.ctx
                .storage
                .applications
                .put(Application {
                    app_eui,
                    name: None,
                })
                .unwrap();
        }

        fn add_device(&self, device: &Device) {
            self.ctx.storage.devices.put(device.clone()).unwrap();
        }

        async fn send(&self, raw: Vec<u8>) {
            let mut radio = RadioContext::new(self.ctx.band.clone());
            radio.data_rate = "SF7BW125".to_string();
            radio.frequency = 868.1;
            let gateway = GatewayContext {
                gateway_eui: Eui::from_u64(0xAA),
                host: "127.0.0.1".to_string(),
                port: 1700,
                ..GatewayContext::default()
            };
            self.input
                .send(GatewayPacket::new(raw, radio, gateway))
                .await
                .unwrap();
        }

        async fn downlink(&mut self) -> GatewayPacket {
            timeout(WAIT, self.output.recv()).await.unwrap().unwrap()
        }

        async fn no_downlink(&mut self) {
            assert!(timeout(QUIET, self.output.recv()).await.is_err());
        }

        async fn wait_for(&self, counter: Counter, value: u64) {
            timeout(WAIT, async {
                while self.metrics.get(counter) < value {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        fn stored(&self, device: &Device) -> Device {
            self.ctx.storage.devices.get_by_eui(&device.dev_eui).unwrap()
        }
    }

    fn abp_device(id: u64, app_eui: Eui, dev_addr: DevAddr) -> Device {
        Device {
            dev_eui: Eui::from_u64(id),
            app_eui,
            dev_addr,
            app_key: AesKey::generate(),
            nwk_skey: AesKey::generate(),
            app_skey: AesKey::generate(),
            state: DeviceState::Abp,
            fcnt_up: 0,
            fcnt_dn: 0,
            relaxed_counter: false,
            key_warning: false,
            dev_nonce_history: vec![],
        }
    }

    fn uplink(mtype: MType, device: &Device, fcnt: u16, ack: bool, port: u8, data: &[u8]) -> Vec<u8> {
        let mut phy = PhyPayload::new(mtype);
        let mp = phy.mac_payload_mut().unwrap();
        mp.fhdr.dev_addr = device.dev_addr;
        mp.fhdr.fcnt = fcnt;
        mp.fhdr.fctrl.ack = ack;
        mp.fport = port;
        mp.frm_payload = data.to_vec();
        phy.encode_message(&device.nwk_skey, &device.app_skey).unwrap()
    }

    /// Decodes, checks the MIC and decrypts a downlink
    fn open_downlink(device: &Device, raw: &[u8]) -> PhyPayload {
        let mut phy = PhyPayload::decode(raw).unwrap();
        let mic = phy.calculate_mic(&device.nwk_skey, &raw[..raw.len() - 4]).unwrap();
        assert_eq!(mic, phy.mic);
        phy.decrypt(&device.nwk_skey, &device.app_skey);
        phy
    }

    #[tokio::test]
    async fn test_confirmed_uplink_then_downstream_then_ack() {
        let mut h = Harness::new();
        let app_eui = Eui::from_u64(0x100);
        h.add_application(app_eui);
        let device = abp_device(1, app_eui, DevAddr(0x2600_0001));
        h.add_device(&device);
        let (_, mut app_rx) = h.ctx.app_router.subscribe(app_eui);

        // Confirmed uplink with nothing queued: bare ack
        h.send(uplink(MType::ConfirmedDataUp, &device, 0, false, 1, b"hi")).await;
        let delivered = timeout(WAIT, app_rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"hi");
        assert_eq!(delivered.port, 1);
        assert_eq!(delivered.device.dev_eui, device.dev_eui);

        let packet = h.downlink().await;
        assert_eq!(packet.radio.rx1_delay, 1);
        assert_eq!(packet.gateway.port, 1700);
        let down = open_downlink(&device, &packet.raw);
        assert_eq!(down.mtype(), MType::UnconfirmedDataDown);
        let mp = down.mac_payload().unwrap();
        assert!(mp.fhdr.fctrl.ack);
        assert_eq!(mp.fport, 0);
        assert!(mp.frm_payload.is_empty());
        assert_eq!(mp.fhdr.fcnt, 0);

        let stored = h.stored(&device);
        assert_eq!(stored.fcnt_up, 1);
        assert_eq!(stored.fcnt_dn, 1);
        let data = h.ctx.storage.data.get_by_device_eui(&device.dev_eui, 10).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].data, b"hi");

        // Queued message that needs an ack goes out confirmed
        h.ctx
            .storage
            .data
            .put_downstream(DownstreamMessage::new(device.dev_eui, 5, vec![0xCA, 0xFE], true))
            .unwrap();
        h.send(uplink(MType::UnconfirmedDataUp, &device, 1, false, 1, b"x")).await;
        let packet = h.downlink().await;
        let down = open_downlink(&device, &packet.raw);
        assert_eq!(down.mtype(), MType::ConfirmedDataDown);
        let mp = down.mac_payload().unwrap();
        assert_eq!(mp.fport, 5);
        assert_eq!(mp.frm_payload, vec![0xCA, 0xFE]);
        assert_eq!(mp.fhdr.fcnt, 1);
        let queued = h.ctx.storage.data.get_downstream(&device.dev_eui).unwrap();
        assert!(queued.sent.is_some());
        assert!(queued.ack_time.is_none());

        // Device acks: message completes and nothing more is sent
        h.send(uplink(MType::UnconfirmedDataUp, &device, 2, true, 1, b"y")).await;
        h.no_downlink().await;
        let queued = h.ctx.storage.data.get_downstream(&device.dev_eui).unwrap();
        assert!(queued.ack_time.is_some());
        assert!(queued.is_complete());

        assert_eq!(h.metrics.get(Counter::ConfirmedUp), 1);
        assert_eq!(h.metrics.get(Counter::UnconfirmedUp), 2);
        assert_eq!(h.metrics.get(Counter::UnconfirmedDown), 1);
        assert_eq!(h.metrics.get(Counter::ConfirmedDown), 1);
        assert_eq!(h.metrics.get(Counter::Encoder), 2);
    }

    #[tokio::test]
    async fn test_unacked_message_is_resent() {
        let mut h = Harness::new();
        let app_eui = Eui::from_u64(0x100);
        h.add_application(app_eui);
        let device = abp_device(2, app_eui, DevAddr(0x2600_0002));
        h.add_device(&device);
        h.ctx
            .storage
            .data
            .put_downstream(DownstreamMessage::new(device.dev_eui, 9, vec![7; 4], true))
            .unwrap();

        for fcnt in 0..2 {
            h.send(uplink(MType::UnconfirmedDataUp, &device, fcnt, false, 1, b"u")).await;
            let down = open_downlink(&device, &h.downlink().await.raw);
            assert_eq!(down.mtype(), MType::ConfirmedDataDown);
            assert_eq!(down.mac_payload().unwrap().frm_payload, vec![7; 4]);
            assert_eq!(down.mac_payload().unwrap().fhdr.fcnt, fcnt);
        }
    }

    #[tokio::test]
    async fn test_mic_selects_device_among_shared_dev_addr() {
        let mut h = Harness::new();
        let (app_a, app_b) = (Eui::from_u64(0xA), Eui::from_u64(0xB));
        h.add_application(app_a);
        h.add_application(app_b);
        let shared = DevAddr(0x2600_00AB);
        let a = abp_device(10, app_a, shared);
        let b = abp_device(11, app_b, shared);
        h.add_device(&a);
        h.add_device(&b);
        let (_, mut rx_a) = h.ctx.app_router.subscribe(app_a);
        let (_, mut rx_b) = h.ctx.app_router.subscribe(app_b);

        h.send(uplink(MType::UnconfirmedDataUp, &a, 5, false, 2, b"from a")).await;
        let delivered = timeout(WAIT, rx_a.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"from a");
        assert_eq!(delivered.device.dev_eui, a.dev_eui);
        h.wait_for(Counter::Decrypter, 1).await;

        assert!(rx_b.try_recv().is_err());
        assert_eq!(h.stored(&a).fcnt_up, 6);
        assert!(!h.stored(&a).key_warning);
        assert_eq!(h.stored(&b), b);
        h.no_downlink().await;
    }

    /// Devices that share DevAddr and both session keys
    fn cloned_keys(id: u64, app_eui: Eui, from: &Device) -> Device {
        Device {
            nwk_skey: from.nwk_skey.clone(),
            app_skey: from.app_skey.clone(),
            ..abp_device(id, app_eui, from.dev_addr)
        }
    }

    #[tokio::test]
    async fn test_key_collision_warns_and_delivers_to_every_match() {
        let mut h = Harness::new();
        let (app_a, app_b) = (Eui::from_u64(0xA), Eui::from_u64(0xB));
        h.add_application(app_a);
        h.add_application(app_b);
        let a = abp_device(20, app_a, DevAddr(0x2600_00CD));
        let b = cloned_keys(21, app_b, &a);
        h.add_device(&a);
        h.add_device(&b);
        let (_, mut rx_a) = h.ctx.app_router.subscribe(app_a);
        let (_, mut rx_b) = h.ctx.app_router.subscribe(app_b);

        h.send(uplink(MType::UnconfirmedDataUp, &a, 7, false, 3, b"both")).await;
        let got_a = timeout(WAIT, rx_a.recv()).await.unwrap().unwrap();
        let got_b = timeout(WAIT, rx_b.recv()).await.unwrap().unwrap();
        assert_eq!(got_a.payload, b"both");
        assert_eq!(got_a.device.dev_eui, a.dev_eui);
        assert_eq!(got_b.payload, b"both");
        assert_eq!(got_b.device.dev_eui, b.dev_eui);
        h.wait_for(Counter::Decrypter, 2).await;

        for device in [&a, &b] {
            let stored = h.stored(device);
            assert!(stored.key_warning);
            assert_eq!(stored.fcnt_up, 8);
        }
        assert_eq!(h.metrics.get(Counter::UnconfirmedUp), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_application_does_not_stop_other_matches() {
        let mut h = Harness::new();
        let good_app = Eui::from_u64(0xC);
        h.add_application(good_app);
        let good = abp_device(30, good_app, DevAddr(0x2600_00EF));
        h.add_device(&good);
        // Applications never provisioned for these
        let orphans: Vec<Device> = (31..38)
            .map(|id| cloned_keys(id, Eui::from_u64(0x1000 + id), &good))
            .collect();
        for orphan in &orphans {
            h.add_device(orphan);
        }
        let (_, mut rx) = h.ctx.app_router.subscribe(good_app);

        h.send(uplink(MType::UnconfirmedDataUp, &good, 3, false, 1, b"ok")).await;
        let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.device.dev_eui, good.dev_eui);
        let all: Vec<&Device> = orphans.iter().chain([&good]).collect();
        timeout(WAIT, async {
            while !all.iter().all(|d| {
                let stored = h.stored(d);
                stored.key_warning && stored.fcnt_up == 4
            }) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.metrics.get(Counter::UnconfirmedUp), 8);
        assert_eq!(h.metrics.get(Counter::Decrypter), 1);
    }

    #[tokio::test]
    async fn test_bad_mic_is_dropped() {
        let mut h = Harness::new();
        let app_eui = Eui::from_u64(0x100);
        h.add_application(app_eui);
        let device = abp_device(3, app_eui, DevAddr(0x2600_0003));
        h.add_device(&device);
        let (_, mut app_rx) = h.ctx.app_router.subscribe(app_eui);

        let mut forged = device.clone();
        forged.nwk_skey = AesKey::generate();
        h.send(uplink(MType::ConfirmedDataUp, &forged, 0, false, 1, b"evil")).await;
        h.wait_for(Counter::MicFailed, 1).await;
        h.no_downlink().await;
        assert!(app_rx.try_recv().is_err());
        assert_eq!(h.stored(&device).fcnt_up, 0);

        // Unknown DevAddr isn't a MIC failure
        let stranger = abp_device(4, app_eui, DevAddr(0x2600_0999));
        h.send(uplink(MType::UnconfirmedDataUp, &stranger, 0, false, 1, b"?")).await;
        h.wait_for(Counter::Decoder, 2).await;
        h.no_downlink().await;
        assert_eq!(h.metrics.get(Counter::MicFailed), 1);
    }

    #[tokio::test]
    async fn test_frame_counter_policy() {
        let mut h = Harness::new();
        let app_eui = Eui::from_u64(0x100);
        h.add_application(app_eui);
        let mut strict = abp_device(20, app_eui, DevAddr(0x2600_0020));
        strict.fcnt_up = 10;
        let mut relaxed = abp_device(21, app_eui, DevAddr(0x2600_0021));
        relaxed.fcnt_up = 10;
        relaxed.relaxed_counter = true;
        h.add_device(&strict);
        h.add_device(&relaxed);
        let (_, mut app_rx) = h.ctx.app_router.subscribe(app_eui);

        h.send(uplink(MType::UnconfirmedDataUp, &strict, 5, false, 1, b"old")).await;
        h.wait_for(Counter::CounterFailed, 1).await;
        assert_eq!(h.stored(&strict).fcnt_up, 10);

        h.send(uplink(MType::UnconfirmedDataUp, &strict, 10, false, 1, b"new")).await;
        let delivered = timeout(WAIT, app_rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"new");
        assert_eq!(h.stored(&strict).fcnt_up, 11);

        h.send(uplink(MType::UnconfirmedDataUp, &relaxed, 3, false, 1, b"reset")).await;
        let delivered = timeout(WAIT, app_rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"reset");
        assert_eq!(h.stored(&relaxed).fcnt_up, 10);
        assert_eq!(h.metrics.get(Counter::CounterFailed), 1);
        h.no_downlink().await;
    }

    fn join_request(device: &Device, dev_nonce: u16) -> Vec<u8> {
        let mut phy = PhyPayload {
            payload: Payload::JoinRequest(JoinRequestPayload {
                app_eui: device.app_eui,
                dev_eui: device.dev_eui,
                dev_nonce,
            }),
            ..PhyPayload::new(MType::JoinRequest)
        };
        phy.encode_join_request(&device.app_key).unwrap()
    }

    #[tokio::test]
    async fn test_join_and_nonce_replay() {
        let mut h = Harness::new();
        let app_eui = Eui::from_u64(0x200);
        h.add_application(app_eui);
        let mut device = abp_device(30, app_eui, DevAddr(0x2600_0030));
        device.state = DeviceState::Otaa;
        device.fcnt_up = 40;
        device.fcnt_dn = 12;
        h.add_device(&device);

        let request = join_request(&device, 0x1234);
        h.send(request.clone()).await;
        let packet = h.downlink().await;
        assert_eq!(packet.radio.rx1_delay, 5);
        assert_eq!(packet.deadline, Duration::from_secs(5));
        let accept = PhyPayload::decode_join_accept(&device.app_key, &packet.raw).unwrap();
        let ja = *accept.join_accept().unwrap();
        assert_eq!(ja.net_id, NETWORK_ID);
        assert_eq!(ja.dev_addr, device.dev_addr);
        assert_eq!(ja.rx_delay, h.ctx.band.otaa_rx_delay());

        let stored = h.stored(&device);
        assert_eq!((stored.fcnt_up, stored.fcnt_dn), (0, 0));
        assert!(stored.has_dev_nonce(0x1234));
        let (nwk_skey, app_skey) =
            derive_session_keys(&device.app_key, ja.app_nonce, NETWORK_ID, 0x1234);
        assert_eq!(stored.nwk_skey, nwk_skey);
        assert_eq!(stored.app_skey, app_skey);
        h.no_downlink().await;

        // Same nonce again is rejected
        h.send(request).await;
        h.wait_for(Counter::JoinRequest, 2).await;
        h.no_downlink().await;
        assert_eq!(h.metrics.get(Counter::JoinAccept), 1);

        // Joined device can talk with its new keys
        let (_, mut app_rx) = h.ctx.app_router.subscribe(app_eui);
        h.send(uplink(MType::UnconfirmedDataUp, &stored, 0, false, 1, b"joined")).await;
        let delivered = timeout(WAIT, app_rx.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.payload, b"joined");
    }

    #[tokio::test]
    async fn test_join_rejections() {
        let mut h = Harness::new();
        let app_eui = Eui::from_u64(0x200);
        h.add_application(app_eui);
        let device = abp_device(31, app_eui, DevAddr(0x2600_0031));
        h.add_device(&device);

        // Wrong AppEUI
        let mut other_app = device.clone();
        other_app.app_eui = Eui::from_u64(0x999);
        h.send(join_request(&other_app, 1)).await;
        // Wrong root key
        let mut wrong_key = device.clone();
        wrong_key.app_key = AesKey::generate();
        h.send(join_request(&wrong_key, 2)).await;
        // Unknown device
        h.send(join_request(&abp_device(99, app_eui, DevAddr(0)), 3)).await;

        h.wait_for(Counter::JoinRequest, 3).await;
        h.no_downlink().await;
        assert_eq!(h.metrics.get(Counter::JoinAccept), 0);
        assert!(h.stored(&device).dev_nonce_history.is_empty());
    }

    #[tokio::test]
    async fn test_join_assigns_dev_addr() {
        let mut h = Harness::new();
        let app_eui = Eui::from_u64(0x300);
        h.add_application(app_eui);
        let device = abp_device(40, app_eui, DevAddr(0));
        h.add_device(&device);

        h.send(join_request(&device, 7)).await;
        let packet = h.downlink().await;
        let accept = PhyPayload::decode_join_accept(&device.app_key, &packet.raw).unwrap();
        let assigned = accept.join_accept().unwrap().dev_addr;
        assert_eq!(u32::from(assigned.nwk_id()), NETWORK_ID & 0x7F);
        assert_eq!(h.stored(&device).dev_addr, assigned);
    }

    #[tokio::test]
    async fn test_closing_input_stops_pipeline() {
        let mut h = Harness::new();
        h.send(vec![0xFF; 3]).await;
        drop(h.input);
        assert!(timeout(WAIT, h.output.recv()).await.unwrap().is_none());
        timeout(WAIT, h.handle.join()).await.unwrap();
    }
}
