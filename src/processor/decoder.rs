use crate::model::frames::{FrameContext, GatewayPacket, LoRaMessage};
use crate::protocol::PhyPayload;
use crate::server::{Counter, ServerContext};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Parses raw radio frames. Frames that don't parse are dropped.
pub struct Decoder {
    context: ServerContext,
}

impl Decoder {
    pub fn new(context: ServerContext) -> Self {
        Self { context }
    }

    pub fn start(
        self,
        mut input: mpsc::Receiver<GatewayPacket>,
        output: mpsc::Sender<LoRaMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(packet) = input.recv().await {
                let context = self.context.clone();
                let output = output.clone();
                tokio::spawn(async move {
                    if let Some(msg) = decode_packet(&context, packet) {
                        if output.send(msg).await.is_err() {
                            debug!("Decoder output closed");
                        }
                    }
                });
            }
            debug!("Decoder input closed");
            // Output closes once every in-flight task has dropped its sender
        })
    }
}

fn decode_packet(context: &ServerContext, packet: GatewayPacket) -> Option<LoRaMessage> {
    let payload = match PhyPayload::decode(&packet.raw) {
        Ok(p) => p,
        Err(e) => {
            info!(
                gateway = %packet.gateway.gateway_eui,
                "Unable to decode {} byte frame: {}", packet.raw.len(), e
            );
            return None;
        }
    };
    context.metrics.increment(Counter::Decoder);
    Some(LoRaMessage {
        payload,
        context: FrameContext::new(packet),
    })
}
