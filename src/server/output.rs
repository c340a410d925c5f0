//! Application outputs. Each output subscribes to one application's payload
//! stream and forwards every message it receives.

use super::events::{EventRouter, SubscriptionId};
use crate::error::Result;
use crate::model::frames::PayloadMessage;
use crate::model::lorawan::Eui;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connector for an external system (MQTT broker, message queue...)
pub trait AppOutput: Send + 'static {
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<()>;

    fn send(&mut self, message: &PayloadMessage) -> Result<()>;

    fn close(&mut self);
}

/// Writes every payload to the log
#[derive(Debug, Default, Clone)]
pub struct LogOutput {
    sent: Arc<AtomicU64>,
}

impl LogOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared count of forwarded messages
    pub fn sent_counter(&self) -> Arc<AtomicU64> {
        self.sent.clone()
    }
}

impl AppOutput for LogOutput {
    fn name(&self) -> &str {
        "log"
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, message: &PayloadMessage) -> Result<()> {
        info!(
            dev_eui = %message.device.dev_eui,
            payload = %message.to_json(),
            "Application payload"
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {}
}

struct Dispatcher {
    app_eui: Eui,
    handle: JoinHandle<()>,
}

/// Runs outputs against the application payload router
pub struct OutputManager {
    router: Arc<EventRouter<PayloadMessage>>,
    dispatchers: Mutex<HashMap<SubscriptionId, Dispatcher>>,
}

impl OutputManager {
    pub fn new(router: Arc<EventRouter<PayloadMessage>>) -> Self {
        Self {
            router,
            dispatchers: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the output and starts forwarding the application's payloads
    pub fn add(&self, app_eui: Eui, mut output: Box<dyn AppOutput>) -> Result<SubscriptionId> {
        output.open()?;
        let (id, mut messages) = self.router.subscribe(app_eui);

        let handle = tokio::spawn(async move {
            debug!(app_eui = %app_eui, output = output.name(), "Output started");
            while let Some(message) = messages.recv().await {
                if let Err(e) = output.send(&message) {
                    warn!(app_eui = %app_eui, output = output.name(), "Output send failed: {}", e);
                }
            }
            output.close();
            debug!(app_eui = %app_eui, output = output.name(), "Output stopped");
        });

        self.dispatchers
            .lock()
            .insert(id, Dispatcher { app_eui, handle });
        Ok(id)
    }

    /// Stops an output once it has drained what it already received
    pub async fn remove(&self, id: SubscriptionId) -> bool {
        let dispatcher = self.dispatchers.lock().remove(&id);
        match dispatcher {
            Some(dispatcher) => {
                self.router.unsubscribe(id);
                if let Err(e) = dispatcher.handle.await {
                    warn!(app_eui = %dispatcher.app_eui, "Output task failed: {}", e);
                }
                true
            }
            None => false,
        }
    }

    pub fn output_count(&self) -> usize {
        self.dispatchers.lock().len()
    }

    pub async fn shutdown(&self) {
        let ids: Vec<SubscriptionId> = self.dispatchers.lock().keys().copied().collect();
        let count = ids.len();
        for id in ids {
            self.remove(id).await;
        }
        info!("{} application outputs shut down", count);
    }
}
