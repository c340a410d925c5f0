use super::semtech::{RxData, TxData, Txpk};
use super::wire::{GatewayMessage, Identifier};
use crate::error::Result;
use crate::model::frames::{GatewayContext, GatewayPacket, RadioContext};
use crate::model::gateway::GatewayEvent;
use crate::model::lorawan::Eui;
use crate::server::{Counter, ServerContext, CHANNEL_CAPACITY};
use base64::Engine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM_SIZE: usize = 8192;
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_FREQUENCY: f32 = 868.1;

/// Channels the pipeline uses to talk to the transport
pub struct GatewayChannels {
    /// Frames to transmit
    pub to_gateway: mpsc::Sender<GatewayPacket>,
    /// Frames received from gateways
    pub from_gateway: mpsc::Receiver<GatewayPacket>,
}

/// Stops the forwarder and waits for it
pub struct ForwarderHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ForwarderHandle {
    /// Same as closing the input: stops reading and closes `from_gateway`
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Packet forwarder task failed: {}", e);
        }
    }
}

/// Semtech UDP packet forwarder endpoint
pub struct UdpPacketForwarder {
    socket: Arc<UdpSocket>,
    context: ServerContext,
    /// Port each gateway last sent PULL_DATA from
    pull_ports: Arc<Mutex<HashMap<Eui, u16>>>,
}

impl UdpPacketForwarder {
    pub async fn bind(addr: SocketAddr, context: ServerContext) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Packet forwarder listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            context,
            pull_ports: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawns the reader, sender and dispatch loops
    pub fn start(self) -> (GatewayChannels, ForwarderHandle) {
        let (to_gateway, input) = mpsc::channel(CHANNEL_CAPACITY);
        let (output, from_gateway) = mpsc::channel(CHANNEL_CAPACITY);
        let (udp_in_tx, udp_in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (udp_out_tx, udp_out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let reader = tokio::spawn(udp_reader(
            self.socket.clone(),
            udp_in_tx,
            shutdown.clone(),
        ));
        let sender = tokio::spawn(udp_sender(
            self.socket.clone(),
            udp_out_rx,
            self.context.clone(),
        ));

        let dispatcher = Dispatcher {
            context: self.context,
            pull_ports: self.pull_ports,
            udp_out: udp_out_tx,
            output,
        };
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            dispatcher.run(input, udp_in_rx, token).await;
            for (name, handle) in [("reader", reader), ("sender", sender)] {
                if let Err(e) = handle.await {
                    error!("UDP {} task failed: {}", name, e);
                }
            }
            info!("Packet forwarder stopped");
        });

        (
            GatewayChannels {
                to_gateway,
                from_gateway,
            },
            ForwarderHandle { shutdown, task },
        )
    }
}

async fn udp_reader(
    socket: Arc<UdpSocket>,
    udp_in: mpsc::Sender<GatewayMessage>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(r) => r,
                Err(e) => {
                    warn!("Unable to read from UDP socket: {}", e);
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let mut msg = match GatewayMessage::decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Unable to decode datagram from {}: {}", addr, e);
                continue;
            }
        };
        msg.host = addr.ip().to_string();
        msg.port = addr.port();

        if udp_in.send(msg).await.is_err() {
            break;
        }
    }
    debug!("UDP reader stopped");
}

async fn udp_sender(
    socket: Arc<UdpSocket>,
    mut udp_out: mpsc::Receiver<GatewayMessage>,
    context: ServerContext,
) {
    while let Some(msg) = udp_out.recv().await {
        let buffer = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                error!("Unable to encode packet forwarder message: {}", e);
                continue;
            }
        };
        if let Some(ref json) = msg.json {
            context
                .gw_event_router
                .publish(msg.gateway_eui, GatewayEvent::Tx(json.clone()));
        }
        if let Err(e) = socket.send_to(&buffer, (msg.host.as_str(), msg.port)).await {
            warn!(
                "Unable to send {} to gateway at {}:{}: {}",
                msg.identifier, msg.host, msg.port, e
            );
            continue;
        }
        context.metrics.increment(Counter::GatewayOut);
    }
    debug!("UDP sender stopped");
}

struct Dispatcher {
    context: ServerContext,
    pull_ports: Arc<Mutex<HashMap<Eui, u16>>>,
    udp_out: mpsc::Sender<GatewayMessage>,
    output: mpsc::Sender<GatewayPacket>,
}

impl Dispatcher {
    async fn run(
        self,
        mut input: mpsc::Receiver<GatewayPacket>,
        mut udp_in: mpsc::Receiver<GatewayMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                packet = input.recv() => match packet {
                    Some(packet) => self.encode_and_send(packet).await,
                    None => break,
                },
                Some(msg) = udp_in.recv() => self.handle_gateway_message(msg).await,
            }
        }

        debug!("Packet forwarder input closed, shutting down");
        shutdown.cancel();
        let gateways: Vec<Eui> = self.pull_ports.lock().keys().copied().collect();
        for eui in gateways {
            self.context
                .gw_event_router
                .publish(eui, GatewayEvent::Inactive);
        }
        // Dropping self closes the pipeline input and lets the sender drain
    }

    async fn handle_gateway_message(&self, msg: GatewayMessage) {
        match msg.identifier {
            Identifier::PullData => {
                debug!(gateway = %msg.gateway_eui, "PULL_DATA received, sending PULL_ACK");
                self.pull_ports.lock().insert(msg.gateway_eui, msg.port);
                self.send_udp(msg.reply(Identifier::PullAck)).await;
                self.context
                    .gw_event_router
                    .publish(msg.gateway_eui, GatewayEvent::KeepAlive);
            }
            Identifier::PushData => {
                let json = msg.json.clone().unwrap_or_default();
                debug!(gateway = %msg.gateway_eui, "PUSH_DATA received: {}", json);
                if !self.gateway_allowed(&msg) {
                    return;
                }
                self.context
                    .gw_event_router
                    .publish(msg.gateway_eui, GatewayEvent::Rx(json));

                let packets = self.decode_rxpk(&msg);
                self.send_udp(msg.reply(Identifier::PushAck)).await;
                self.context.metrics.increment(Counter::GatewayIn);
                for packet in packets {
                    if self.output.send(packet).await.is_err() {
                        warn!("Pipeline input closed, dropping uplink");
                    }
                }
            }
            Identifier::TxAck => {}
            other => {
                info!(gateway = %msg.gateway_eui, "Don't know how to handle {} from gateway", other);
            }
        }
    }

    fn gateway_allowed(&self, msg: &GatewayMessage) -> bool {
        if self.context.config.gateway.disable_gateway_checks {
            return true;
        }
        let gateway = match self.context.storage.gateways.get(&msg.gateway_eui) {
            Ok(gw) => gw,
            Err(e) => {
                info!(gateway = %msg.gateway_eui, "Unable to locate gateway: {}", e);
                return false;
            }
        };
        if gateway.strict_ip && msg.host.parse::<IpAddr>().ok() != Some(gateway.ip) {
            warn!(
                gateway = %msg.gateway_eui,
                "IP mismatch for gateway: {} (should be {})", msg.host, gateway.ip
            );
            return false;
        }
        true
    }

    fn decode_rxpk(&self, msg: &GatewayMessage) -> Vec<GatewayPacket> {
        let Some(ref json) = msg.json else {
            return Vec::new();
        };
        let data: RxData = match serde_json::from_str(json) {
            Ok(d) => d,
            Err(e) => {
                info!(
                    "Unable to decode JSON from {}:{}: {} (json={})",
                    msg.host, msg.port, e, json
                );
                return Vec::new();
            }
        };

        let mut packets = Vec::with_capacity(data.rxpk.len());
        for rxpk in data.rxpk {
            let raw = match base64::engine::general_purpose::STANDARD.decode(&rxpk.data) {
                Ok(raw) => raw,
                Err(e) => {
                    info!("Unable to decode base64 payload {:?}: {}", rxpk.data, e);
                    continue;
                }
            };

            let band = self.context.band.clone();
            let frequency = if rxpk.freq > 0.0 {
                rxpk.freq
            } else {
                band.channel_frequency(rxpk.chan).unwrap_or_else(|| {
                    warn!("Unknown channel {}, assuming {} MHz", rxpk.chan, DEFAULT_FREQUENCY);
                    DEFAULT_FREQUENCY
                })
            };
            let radio = RadioContext {
                channel: rxpk.chan,
                rf_chain: rxpk.rfch,
                frequency,
                data_rate: rxpk.datr,
                rssi: rxpk.rssi,
                snr: rxpk.lsnr,
                ..RadioContext::new(band)
            };
            let gateway = GatewayContext {
                gateway_eui: msg.gateway_eui,
                host: msg.host.clone(),
                port: msg.port,
                gateway_clock: rxpk.tmst,
                protocol_version: msg.protocol_version,
            };
            packets.push(GatewayPacket::new(raw, radio, gateway));
        }
        packets
    }

    /// Wraps a frame in PULL_RESP for the gateway that received the uplink
    async fn encode_and_send(&self, packet: GatewayPacket) {
        let timestamp = packet
            .gateway
            .gateway_clock
            .wrapping_add(1_000_000u32.wrapping_mul(u32::from(packet.radio.rx1_delay)));
        let tx = TxData {
            txpk: Txpk {
                tmst: Some(timestamp),
                freq: packet.radio.frequency,
                rfch: 0,
                modu: "LORA".to_string(),
                datr: packet.radio.data_rate.clone(),
                codr: "4/5".to_string(),
                ipol: true,
                size: packet.raw.len(),
                data: base64::engine::general_purpose::STANDARD.encode(&packet.raw),
                ..Txpk::default()
            },
        };
        let json = match serde_json::to_string(&tx) {
            Ok(j) => j,
            Err(e) => {
                info!("Unable to encode txpk: {}", e);
                return;
            }
        };

        let eui = packet.gateway.gateway_eui;
        let port = match self.pull_ports.lock().get(&eui).copied() {
            Some(port) => port,
            None => {
                warn!(
                    gateway = %eui,
                    "Gateway hasn't sent PULL_DATA yet, using uplink port {}", packet.gateway.port
                );
                packet.gateway.port
            }
        };

        let mut msg = GatewayMessage::new(Identifier::PullResp, rand::random::<u16>());
        msg.protocol_version = packet.gateway.protocol_version;
        msg.gateway_eui = eui;
        msg.host = packet.gateway.host.clone();
        msg.port = port;
        msg.json = Some(json);
        self.send_udp(msg).await;

        let elapsed = packet.received_at.elapsed();
        let latency = self.context.config.gateway.assumed_latency;
        if elapsed > packet.deadline.saturating_sub(latency) {
            error!(
                gateway = %eui,
                "Packet missed deadline of {:?} with assumed latency {:?} (took {:?})",
                packet.deadline, latency, elapsed
            );
            self.context.metrics.increment(Counter::MissedDeadline);
        }
    }

    async fn send_udp(&self, msg: GatewayMessage) {
        if self.udp_out.send(msg).await.is_err() {
            warn!("UDP sender stopped, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::gateway::Gateway;
    use crate::server::InMemoryMetrics;
    use crate::storage::Storage;
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    const GATEWAY_EUI: u64 = 0xAA55_5A00_0000_0101;

    async fn start_forwarder(
        strict_ip: IpAddr,
    ) -> (
        SocketAddr,
        GatewayChannels,
        ForwarderHandle,
        ServerContext,
        Arc<InMemoryMetrics>,
    ) {
        let storage = Storage::in_memory();
        storage
            .gateways
            .put(Gateway {
                gateway_eui: Eui::from_u64(GATEWAY_EUI),
                ip: strict_ip,
                strict_ip: true,
                location: None,
            })
            .unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let context = ServerContext::new(Config::default(), storage, metrics.clone());
        let forwarder = UdpPacketForwarder::bind("127.0.0.1:0".parse().unwrap(), context.clone())
            .await
            .unwrap();
        let addr = forwarder.local_addr().unwrap();
        let (channels, handle) = forwarder.start();
        (addr, channels, handle, context, metrics)
    }

    fn push_data(token: u16, eui: u64, json: &str) -> Vec<u8> {
        let mut msg = GatewayMessage::new(Identifier::PushData, token);
        msg.gateway_eui = Eui::from_u64(eui);
        msg.json = Some(json.to_string());
        msg.encode().unwrap()
    }

    async fn recv_message(socket: &UdpSocket) -> GatewayMessage {
        let mut buf = [0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        GatewayMessage::decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_pull_push_and_downlink() {
        let (addr, mut channels, handle, context, metrics) =
            start_forwarder(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        let gw_eui = Eui::from_u64(GATEWAY_EUI);
        let (_, mut events) = context.gw_event_router.subscribe(gw_eui);

        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut pull = GatewayMessage::new(Identifier::PullData, 0x1234);
        pull.gateway_eui = gw_eui;
        gateway.send_to(&pull.encode().unwrap(), addr).await.unwrap();
        let ack = recv_message(&gateway).await;
        assert_eq!(ack.identifier, Identifier::PullAck);
        assert_eq!(ack.token, 0x1234);
        assert_eq!(events.recv().await, Some(GatewayEvent::KeepAlive));

        let json = r#"{"rxpk":[{"tmst":1000,"chan":1,"rfch":0,"freq":0,"modu":"LORA",
            "datr":"SF7BW125","codr":"4/5","rssi":-40,"lsnr":9.5,"size":3,"data":"AQID"}]}"#;
        gateway
            .send_to(&push_data(0x4321, GATEWAY_EUI, json), addr)
            .await
            .unwrap();
        let ack = recv_message(&gateway).await;
        assert_eq!(ack.identifier, Identifier::PushAck);
        assert_eq!(ack.token, 0x4321);
        assert!(matches!(events.recv().await, Some(GatewayEvent::Rx(_))));

        let packet = timeout(Duration::from_secs(2), channels.from_gateway.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.raw, vec![1, 2, 3]);
        assert_eq!(packet.radio.frequency, 868.3);
        assert_eq!(packet.radio.rssi, -40);
        assert_eq!(packet.gateway.gateway_clock, 1000);
        assert_eq!(packet.gateway.gateway_eui, gw_eui);

        let mut downlink = packet.clone();
        downlink.raw = vec![9, 8, 7, 6];
        downlink.radio.rx1_delay = 1;
        downlink.deadline = Duration::from_secs(1);
        channels.to_gateway.send(downlink).await.unwrap();

        let resp = recv_message(&gateway).await;
        assert_eq!(resp.identifier, Identifier::PullResp);
        let tx: TxData = serde_json::from_str(resp.json.as_deref().unwrap()).unwrap();
        assert_eq!(tx.txpk.tmst, Some(1_001_000));
        assert_eq!(tx.txpk.size, 4);
        assert_eq!(tx.txpk.modu, "LORA");
        assert!(tx.txpk.ipol);
        assert!(matches!(events.recv().await, Some(GatewayEvent::Tx(_))));
        assert_eq!(metrics.get(Counter::GatewayIn), 1);
        assert_eq!(metrics.get(Counter::MissedDeadline), 0);

        handle.stop();
        handle.join().await;
        assert!(channels.from_gateway.recv().await.is_none());
        assert_eq!(events.recv().await, Some(GatewayEvent::Inactive));
    }

    #[tokio::test]
    async fn test_unknown_gateway_is_dropped() {
        let (addr, mut channels, handle, _, metrics) =
            start_forwarder(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        gateway
            .send_to(&push_data(1, 0x0102, r#"{"rxpk":[{"data":"AQID"}]}"#), addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(200), gateway.recv_from(&mut buf))
                .await
                .is_err()
        );
        assert!(channels.from_gateway.try_recv().is_err());
        assert_eq!(metrics.get(Counter::GatewayIn), 0);
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_strict_ip_mismatch_is_dropped() {
        let (addr, mut channels, handle, _, _) =
            start_forwarder(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))).await;
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        gateway
            .send_to(&push_data(1, GATEWAY_EUI, r#"{"rxpk":[{"data":"AQID"}]}"#), addr)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        assert!(
            timeout(Duration::from_millis(200), gateway.recv_from(&mut buf))
                .await
                .is_err()
        );
        assert!(channels.from_gateway.try_recv().is_err());
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_missed_deadline_is_counted() {
        let (_, channels, handle, _, metrics) =
            start_forwarder(IpAddr::V4(Ipv4Addr::LOCALHOST)).await;
        let radio = RadioContext::new(Arc::new(crate::band::Eu868::new()));
        let gateway = GatewayContext {
            host: "127.0.0.1".to_string(),
            port: 9,
            ..GatewayContext::default()
        };
        // Zero deadline is always missed
        let packet = GatewayPacket::new(vec![1], radio, gateway);
        channels.to_gateway.send(packet).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while metrics.get(Counter::MissedDeadline) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.stop();
        handle.join().await;
    }
}
