//! Shared state handed to the transport and every pipeline stage

pub mod events;
pub mod frame_output;
pub mod metrics;
pub mod output;

use crate::band::{BandPlan, Eu868};
use crate::config::Config;
use crate::model::frames::PayloadMessage;
use crate::model::gateway::GatewayEvent;
use crate::storage::Storage;
use std::sync::Arc;

pub use events::{EventRouter, SubscriptionId};
pub use frame_output::FrameOutputBuffer;
pub use metrics::{Counter, InMemoryMetrics, MetricsSink};
pub use output::{AppOutput, LogOutput, OutputManager};

/// Buffer size for channels between the transport and pipeline stages
pub const CHANNEL_CAPACITY: usize = 16;

#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<Config>,
    pub storage: Storage,
    pub frame_output: Arc<FrameOutputBuffer>,
    /// Clear-text payloads keyed by application EUI
    pub app_router: Arc<EventRouter<PayloadMessage>>,
    /// Gateway telemetry keyed by gateway EUI
    pub gw_event_router: Arc<EventRouter<GatewayEvent>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub band: Arc<dyn BandPlan>,
}

impl ServerContext {
    pub fn new(config: Config, storage: Storage, metrics: Arc<dyn MetricsSink>) -> Self {
        let channel_length = config.server.event_channel_length;
        Self {
            config: Arc::new(config),
            storage,
            frame_output: Arc::new(FrameOutputBuffer::new()),
            app_router: Arc::new(EventRouter::new(channel_length)),
            gw_event_router: Arc::new(EventRouter::new(channel_length)),
            metrics,
            band: Arc::new(Eu868::new()),
        }
    }
}
