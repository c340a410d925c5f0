//! Seeds storage from a JSON provisioning file.
//!
//! ```json
//! {
//!   "applications": [{ "app_eui": "70-b3-d5-7e-d0-00-00-01", "name": "sensors" }],
//!   "devices": [{ "dev_eui": "...", "app_eui": "...", "dev_addr": "26011f2a",
//!                 "app_key": "...", "nwk_skey": "...", "app_skey": "...", "state": "ABP" }],
//!   "gateways": [{ "gateway_eui": "...", "ip": "10.0.0.7", "strict_ip": true }]
//! }
//! ```

use super::Storage;
use crate::error::{LoraNsError, Result};
use crate::model::device::{Application, Device};
use crate::model::gateway::Gateway;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provisioning {
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
}

impl Provisioning {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoraNsError::ConfigError(format!(
                "Failed to read provisioning file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes everything into `storage`. Entries that already exist are skipped.
    pub fn apply(&self, storage: &Storage) -> Result<()> {
        for app in &self.applications {
            skip_conflict(storage.applications.put(app.clone()), "application")?;
        }

        for device in &self.devices {
            if storage.applications.get_by_eui(&device.app_eui).is_err() {
                warn!(
                    dev_eui = %device.dev_eui,
                    app_eui = %device.app_eui,
                    "Provisioned device references an unknown application"
                );
            }
            skip_conflict(storage.devices.put(device.clone()), "device")?;
        }

        for gateway in &self.gateways {
            skip_conflict(storage.gateways.put(gateway.clone()), "gateway")?;
        }

        info!(
            applications = self.applications.len(),
            devices = self.devices.len(),
            gateways = self.gateways.len(),
            "Provisioning applied"
        );
        Ok(())
    }
}

fn skip_conflict(result: Result<()>, kind: &str) -> Result<()> {
    match result {
        Err(LoraNsError::Conflict(msg)) => {
            warn!("Skipping provisioned {}: {}", kind, msg);
            Ok(())
        }
        other => other,
    }
}
