use crate::band::Modulation;
use crate::model::device::Device;
use crate::model::frames::{LoRaMessage, RadioContext};
use crate::protocol::{Cid, MacCommand};
use crate::server::{Counter, ServerContext};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dispatches uplink MAC commands by CID and passes every frame on
pub struct MacProcessor {
    context: ServerContext,
}

impl MacProcessor {
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
                tokio::spawn(async move {
                    process_commands(&context, &msg);
                    if output.send(msg).await.is_err() {
                        debug!("Scheduler input closed");
                    }
                    context.metrics.increment(Counter::MacProcessor);
                });
            }
            debug!("MAC processor input closed");
        })
    }
}

fn process_commands(context: &ServerContext, msg: &LoRaMessage) {
    let (Some(mac_payload), Some(device)) = (msg.payload.mac_payload(), &msg.context.device) else {
        return;
    };
    for cmd in mac_payload.fhdr.fopts.iter().chain(mac_payload.mac_commands.iter()) {
        handle_command(context, device, &msg.context.packet.radio, cmd);
    }
}

fn handle_command(context: &ServerContext, device: &Device, radio: &RadioContext, cmd: &MacCommand) {
    match cmd.cid() {
        Cid::LinkCheck => {
            let answer = MacCommand::link_check_ans(link_margin(radio), 1);
            if context
                .frame_output
                .add_mac_command(device.dev_eui, answer)
                .is_ok()
            {
                debug!(dev_eui = %device.dev_eui, "Queued LinkCheckAns");
            }
        }
        Cid::DevStatus => {
            let body = cmd.body();
            if let [battery, margin] = body {
                // margin is a signed 6-bit value
                let margin = ((*margin << 2) as i8) >> 2;
                info!(
                    dev_eui = %device.dev_eui,
                    "DevStatusAns: battery={} margin={}dB", battery, margin
                );
            }
        }
        Cid::LinkAdr
        | Cid::DutyCycle
        | Cid::RxParamSetup
        | Cid::NewChannel
        | Cid::RxTimingSetup
        | Cid::PingSlotInfo
        | Cid::PingSlotChannel
        | Cid::BeaconTiming
        | Cid::BeaconFreq => {
            debug!(dev_eui = %device.dev_eui, "{} not implemented", cmd.name());
        }
    }
}

/// dB above the demodulation floor for the uplink's spreading factor
fn link_margin(radio: &RadioContext) -> u8 {
    let floor = match radio
        .band
        .data_rate(&radio.data_rate)
        .and_then(|dr| radio.band.encoding(dr))
    {
        Ok(enc) if enc.modulation == Modulation::LoRa => {
            -20.0 + 2.5 * f32::from(12u8.saturating_sub(enc.spreading_factor))
        }
        Ok(_) => 0.0,
        Err(e) => {
            warn!("Unable to work out link margin: {}", e);
            0.0
        }
    };
    (radio.snr - floor).clamp(0.0, 254.0) as u8
}
