//! Storage interfaces used by the packet path. Persistent backends live
//! outside this crate; `memory` provides the in-process implementation.

use crate::error::Result;
use crate::model::device::{Application, Device, DeviceData, DownstreamMessage};
use crate::model::gateway::Gateway;
use crate::model::lorawan::{DevAddr, Eui};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod memory;
pub mod provision;

pub use memory::{MemoryApplicationStore, MemoryDataStore, MemoryDeviceStore, MemoryGatewayStore};
pub use provision::Provisioning;

pub trait DeviceStorage: Send + Sync {
    fn get_by_eui(&self, dev_eui: &Eui) -> Result<Device>;

    /// Every device currently using the address. DevAddr isn't unique.
    fn get_by_dev_addr(&self, dev_addr: DevAddr) -> Result<Vec<Device>>;

    /// Fails with `Conflict` if the EUI is taken
    fn put(&self, device: Device) -> Result<()>;

    fn add_dev_nonce(&self, device: &Device, dev_nonce: u16) -> Result<()>;

    /// Persists frame counters and the key warning flag only
    fn update_state(&self, device: &Device) -> Result<()>;

    /// Replaces every field of the stored device
    fn update(&self, device: &Device) -> Result<()>;
}

pub trait ApplicationStorage: Send + Sync {
    fn put(&self, application: Application) -> Result<()>;

    fn get_by_eui(&self, app_eui: &Eui) -> Result<Application>;
}

pub trait GatewayStorage: Send + Sync {
    fn put(&self, gateway: Gateway) -> Result<()>;

    fn get(&self, gateway_eui: &Eui) -> Result<Gateway>;
}

pub trait DataStorage: Send + Sync {
    fn put(&self, data: DeviceData) -> Result<()>;

    /// Newest first
    fn get_by_device_eui(&self, dev_eui: &Eui, limit: usize) -> Result<Vec<DeviceData>>;

    /// Fails with `Conflict` while an earlier message is still in progress
    fn put_downstream(&self, message: DownstreamMessage) -> Result<()>;

    fn get_downstream(&self, dev_eui: &Eui) -> Result<DownstreamMessage>;

    fn delete_downstream(&self, dev_eui: &Eui) -> Result<()>;

    fn update_downstream(
        &self,
        dev_eui: &Eui,
        sent: Option<DateTime<Utc>>,
        ack_time: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Bundle of storage backends shared by every pipeline stage
#[derive(Clone)]
pub struct Storage {
    pub devices: Arc<dyn DeviceStorage>,
    pub applications: Arc<dyn ApplicationStorage>,
    pub gateways: Arc<dyn GatewayStorage>,
    pub data: Arc<dyn DataStorage>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            devices: Arc::new(MemoryDeviceStore::new()),
            applications: Arc::new(MemoryApplicationStore::new()),
            gateways: Arc::new(MemoryGatewayStore::new()),
            data: Arc::new(MemoryDataStore::new()),
        }
    }
}
