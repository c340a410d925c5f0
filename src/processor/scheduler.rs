//! Waits out the receive-window budget and pulls the next frame for a
//! device from the output buffer. At most one send per device is in
//! flight; the bookkeeping lives in a single select loop.

use crate::error::LoraNsError;
use crate::model::frames::LoRaMessage;
use crate::model::lorawan::Eui;
use crate::protocol::MType;
use crate::server::{Counter, ServerContext, CHANNEL_CAPACITY};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct Scheduler {
    context: ServerContext,
    rx_delay: Duration,
}

impl Scheduler {
    pub fn new(context: ServerContext) -> Self {
        let rx_delay = context.config.server.rx_delay;
        Self { context, rx_delay }
    }

    pub fn with_rx_delay(mut self, rx_delay: Duration) -> Self {
        self.rx_delay = rx_delay;
        self
    }

    pub fn start(
        self,
        mut input: mpsc::Receiver<LoRaMessage>,
        output: mpsc::Sender<LoRaMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (done_tx, mut done_rx) = mpsc::channel::<Eui>(CHANNEL_CAPACITY);
            let mut in_flight: HashSet<Eui> = HashSet::new();
            let mut input_open = true;

            while input_open || !in_flight.is_empty() {
                tokio::select! {
                    msg = input.recv(), if input_open => match msg {
                        Some(msg) => self.schedule(msg, &mut in_flight, &done_tx, &output),
                        None => {
                            debug!("Scheduler input closed, {} sends in flight", in_flight.len());
                            input_open = false;
                        }
                    },
                    Some(dev_eui) = done_rx.recv() => {
                        in_flight.remove(&dev_eui);
                    }
                }
            }
            debug!("Scheduler stopped");
        })
    }

    fn schedule(
        &self,
        msg: LoRaMessage,
        in_flight: &mut HashSet<Eui>,
        done: &mpsc::Sender<Eui>,
        output: &mpsc::Sender<LoRaMessage>,
    ) {
        self.context.metrics.increment(Counter::SchedulerIn);
        let Some(ref device) = msg.context.device else {
            info!("Frame without a device reached the scheduler, dropping");
            return;
        };
        let dev_eui = device.dev_eui;
        if !in_flight.insert(dev_eui) {
            info!(dev_eui = %dev_eui, "Send already scheduled for device, ignoring duplicate");
            return;
        }

        let delay = self
            .rx_delay
            .saturating_sub(msg.context.packet.received_at.elapsed());
        let context = self.context.clone();
        let done = done.clone();
        let output = output.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            send_next_frame(&context, msg, &output).await;
            let _ = done.send(dev_eui).await;
        });
    }
}

async fn send_next_frame(
    context: &ServerContext,
    msg: LoRaMessage,
    output: &mpsc::Sender<LoRaMessage>,
) {
    let Some(ref device) = msg.context.device else {
        return;
    };
    let payload = match context
        .frame_output
        .get_phy_payload_for_device(device, &msg.context)
    {
        Ok(p) => p,
        Err(LoraNsError::NothingToSend(_)) => {
            debug!(dev_eui = %device.dev_eui, "Nothing to send");
            return;
        }
        Err(e) => {
            info!(dev_eui = %device.dev_eui, "Unable to build downlink: {}", e);
            return;
        }
    };

    match payload.mtype() {
        MType::ConfirmedDataDown => context.metrics.increment(Counter::ConfirmedDown),
        MType::UnconfirmedDataDown => context.metrics.increment(Counter::UnconfirmedDown),
        _ => {}
    }
    let msg = LoRaMessage {
        payload,
        context: msg.context,
    };
    if output.send(msg).await.is_err() {
        debug!("Encoder input closed");
        return;
    }
    context.metrics.increment(Counter::SchedulerOut);
}
