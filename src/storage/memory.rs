use super::{ApplicationStorage, DataStorage, DeviceStorage, GatewayStorage};
use crate::error::{LoraNsError, Result};
use crate::model::device::{Application, Device, DeviceData, DownstreamMessage};
use crate::model::gateway::Gateway;
use crate::model::lorawan::{DevAddr, Eui};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Device data kept per device
const MAX_DATA_PER_DEVICE: usize = 1000;

/// Thread-safe device store with a DevAddr index
#[derive(Clone, Default)]
pub struct MemoryDeviceStore {
    devices: Arc<DashMap<Eui, Device>>,
    by_dev_addr: Arc<DashMap<DevAddr, Vec<Eui>>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn modify<F: FnOnce(&mut Device)>(&self, dev_eui: &Eui, f: F) -> Result<()> {
        match self.devices.get_mut(dev_eui) {
            Some(mut entry) => {
                f(entry.value_mut());
                Ok(())
            }
            None => Err(LoraNsError::NotFound(format!("device {}", dev_eui))),
        }
    }

    fn index(&self, dev_addr: DevAddr, dev_eui: Eui) {
        let mut euis = self.by_dev_addr.entry(dev_addr).or_default();
        if !euis.contains(&dev_eui) {
            euis.push(dev_eui);
        }
    }

    fn unindex(&self, dev_addr: DevAddr, dev_eui: &Eui) {
        if let Entry::Occupied(mut entry) = self.by_dev_addr.entry(dev_addr) {
            entry.get_mut().retain(|e| e != dev_eui);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }
}

impl DeviceStorage for MemoryDeviceStore {
    fn get_by_eui(&self, dev_eui: &Eui) -> Result<Device> {
        self.devices
            .get(dev_eui)
            .map(|r| r.value().clone())
            .ok_or_else(|| LoraNsError::NotFound(format!("device {}", dev_eui)))
    }

    fn get_by_dev_addr(&self, dev_addr: DevAddr) -> Result<Vec<Device>> {
        let euis = match self.by_dev_addr.get(&dev_addr) {
            Some(r) => r.value().clone(),
            None => return Ok(Vec::new()),
        };
        Ok(euis
            .iter()
            .filter_map(|eui| self.devices.get(eui).map(|r| r.value().clone()))
            .filter(|d| d.dev_addr == dev_addr)
            .collect())
    }

    fn put(&self, device: Device) -> Result<()> {
        let (dev_addr, dev_eui) = (device.dev_addr, device.dev_eui);
        match self.devices.entry(dev_eui) {
            Entry::Occupied(_) => {
                return Err(LoraNsError::Conflict(format!(
                    "device {} already exists",
                    dev_eui
                )))
            }
            Entry::Vacant(v) => {
                v.insert(device);
            }
        }
        self.index(dev_addr, dev_eui);
        Ok(())
    }

    fn add_dev_nonce(&self, device: &Device, dev_nonce: u16) -> Result<()> {
        self.modify(&device.dev_eui, |d| {
            if !d.dev_nonce_history.contains(&dev_nonce) {
                d.dev_nonce_history.push(dev_nonce);
            }
        })
    }

    fn update_state(&self, device: &Device) -> Result<()> {
        self.modify(&device.dev_eui, |d| {
            d.fcnt_up = device.fcnt_up;
            d.fcnt_dn = device.fcnt_dn;
            d.key_warning = device.key_warning;
        })
    }

    fn update(&self, device: &Device) -> Result<()> {
        let mut previous = device.dev_addr;
        self.modify(&device.dev_eui, |d| {
            previous = d.dev_addr;
            // the nonce history is owned by add_dev_nonce
            let history = std::mem::take(&mut d.dev_nonce_history);
            *d = device.clone();
            for nonce in history {
                if !d.dev_nonce_history.contains(&nonce) {
                    d.dev_nonce_history.push(nonce);
                }
            }
        })?;
        if previous != device.dev_addr {
            self.unindex(previous, &device.dev_eui);
            self.index(device.dev_addr, device.dev_eui);
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryApplicationStore {
    applications: Arc<DashMap<Eui, Application>>,
}

impl MemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApplicationStorage for MemoryApplicationStore {
    fn put(&self, application: Application) -> Result<()> {
        match self.applications.entry(application.app_eui) {
            Entry::Occupied(_) => Err(LoraNsError::Conflict(format!(
                "application {} already exists",
                application.app_eui
            ))),
            Entry::Vacant(v) => {
                v.insert(application);
                Ok(())
            }
        }
    }

    fn get_by_eui(&self, app_eui: &Eui) -> Result<Application> {
        self.applications
            .get(app_eui)
            .map(|r| r.value().clone())
            .ok_or_else(|| LoraNsError::NotFound(format!("application {}", app_eui)))
    }
}

#[derive(Clone, Default)]
pub struct MemoryGatewayStore {
    gateways: Arc<DashMap<Eui, Gateway>>,
}

impl MemoryGatewayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GatewayStorage for MemoryGatewayStore {
    fn put(&self, gateway: Gateway) -> Result<()> {
        match self.gateways.entry(gateway.gateway_eui) {
            Entry::Occupied(_) => Err(LoraNsError::Conflict(format!(
                "gateway {} already exists",
                gateway.gateway_eui
            ))),
            Entry::Vacant(v) => {
                v.insert(gateway);
                Ok(())
            }
        }
    }

    fn get(&self, gateway_eui: &Eui) -> Result<Gateway> {
        self.gateways
            .get(gateway_eui)
            .map(|r| r.value().clone())
            .ok_or_else(|| LoraNsError::NotFound(format!("gateway {}", gateway_eui)))
    }
}

/// Device data and downstream messages
#[derive(Clone, Default)]
pub struct MemoryDataStore {
    data: Arc<DashMap<Eui, Arc<RwLock<VecDeque<DeviceData>>>>>,
    downstream: Arc<DashMap<Eui, DownstreamMessage>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStorage for MemoryDataStore {
    fn put(&self, data: DeviceData) -> Result<()> {
        let series = self
            .data
            .entry(data.dev_eui)
            .or_insert_with(|| Arc::new(RwLock::new(VecDeque::new())))
            .clone();
        let mut series = series.write();
        if series.len() >= MAX_DATA_PER_DEVICE {
            series.pop_front();
        }
        series.push_back(data);
        Ok(())
    }

    fn get_by_device_eui(&self, dev_eui: &Eui, limit: usize) -> Result<Vec<DeviceData>> {
        Ok(self
            .data
            .get(dev_eui)
            .map(|series| series.read().iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn put_downstream(&self, message: DownstreamMessage) -> Result<()> {
        match self.downstream.entry(message.dev_eui) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_complete() {
                    return Err(LoraNsError::Conflict(format!(
                        "device {} has a pending downstream message",
                        message.dev_eui
                    )));
                }
                existing.insert(message);
                Ok(())
            }
            Entry::Vacant(v) => {
                v.insert(message);
                Ok(())
            }
        }
    }

    fn get_downstream(&self, dev_eui: &Eui) -> Result<DownstreamMessage> {
        self.downstream
            .get(dev_eui)
            .map(|r| r.value().clone())
            .ok_or_else(|| LoraNsError::NotFound(format!("downstream message for {}", dev_eui)))
    }

    fn delete_downstream(&self, dev_eui: &Eui) -> Result<()> {
        self.downstream
            .remove(dev_eui)
            .map(|_| ())
            .ok_or_else(|| LoraNsError::NotFound(format!("downstream message for {}", dev_eui)))
    }

    fn update_downstream(
        &self,
        dev_eui: &Eui,
        sent: Option<DateTime<Utc>>,
        ack_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match self.downstream.get_mut(dev_eui) {
            Some(mut msg) => {
                msg.sent = sent;
                msg.ack_time = ack_time;
                Ok(())
            }
            None => Err(LoraNsError::NotFound(format!(
                "downstream message for {}",
                dev_eui
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::device::DeviceState;
    use crate::model::lorawan::AesKey;
    use std::net::{IpAddr, Ipv4Addr};

    fn device(eui: u64, addr: u32) -> Device {
        Device {
            dev_eui: Eui::from_u64(eui),
            app_eui: Eui::from_u64(0xA),
            dev_addr: DevAddr(addr),
            app_key: AesKey::generate(),
            nwk_skey: AesKey::generate(),
            app_skey: AesKey::generate(),
            state: DeviceState::Abp,
            fcnt_up: 0,
            fcnt_dn: 0,
            relaxed_counter: false,
            key_warning: false,
            dev_nonce_history: Vec::new(),
        }
    }

    #[test]
    fn test_device_put_and_lookup() {
        let store = MemoryDeviceStore::new();
        store.put(device(1, 0x100)).unwrap();
        store.put(device(2, 0x100)).unwrap();
        store.put(device(3, 0x200)).unwrap();
        assert_eq!(store.device_count(), 3);

        assert!(matches!(
            store.put(device(1, 0x300)),
            Err(LoraNsError::Conflict(_))
        ));
        assert_eq!(store.get_by_dev_addr(DevAddr(0x100)).unwrap().len(), 2);
        assert!(store.get_by_dev_addr(DevAddr(0x999)).unwrap().is_empty());
        assert!(store.get_by_eui(&Eui::from_u64(9)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_moves_dev_addr_index() {
        let store = MemoryDeviceStore::new();
        let mut joined = device(1, 0);
        store.put(joined.clone()).unwrap();
        store.put(device(2, 0)).unwrap();

        joined.dev_addr = DevAddr(0x2601_0042);
        store.update(&joined).unwrap();

        let found = store.get_by_dev_addr(DevAddr(0x2601_0042)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].dev_eui, joined.dev_eui);
        let left = store.get_by_dev_addr(DevAddr(0)).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].dev_eui, Eui::from_u64(2));

        // A failed update leaves the index alone
        assert!(store.update(&device(9, 0x77)).unwrap_err().is_not_found());
        assert!(store.get_by_dev_addr(DevAddr(0x77)).unwrap().is_empty());
    }

    #[test]
    fn test_update_state_only_touches_counters() {
        let store = MemoryDeviceStore::new();
        let original = device(1, 0x100);
        store.put(original.clone()).unwrap();

        let mut changed = original.clone();
        changed.fcnt_up = 10;
        changed.fcnt_dn = 4;
        changed.key_warning = true;
        changed.dev_addr = DevAddr(0x555);
        store.update_state(&changed).unwrap();

        let stored = store.get_by_eui(&original.dev_eui).unwrap();
        assert_eq!(stored.fcnt_up, 10);
        assert_eq!(stored.fcnt_dn, 4);
        assert!(stored.key_warning);
        assert_eq!(stored.dev_addr, DevAddr(0x100));
    }

    #[test]
    fn test_update_keeps_nonce_history() {
        let store = MemoryDeviceStore::new();
        let d = device(1, 0x100);
        store.put(d.clone()).unwrap();
        store.add_dev_nonce(&d, 77).unwrap();

        let mut joined = d.clone();
        joined.dev_addr = DevAddr(0x777);
        store.update(&joined).unwrap();

        let stored = store.get_by_eui(&d.dev_eui).unwrap();
        assert_eq!(stored.dev_addr, DevAddr(0x777));
        assert!(stored.has_dev_nonce(77));
    }

    #[test]
    fn test_downstream_conflict_until_complete() {
        let store = MemoryDataStore::new();
        let eui = Eui::from_u64(1);
        store
            .put_downstream(DownstreamMessage::new(eui, 1, vec![1], true))
            .unwrap();
        assert!(matches!(
            store.put_downstream(DownstreamMessage::new(eui, 1, vec![2], false)),
            Err(LoraNsError::Conflict(_))
        ));

        let now = Utc::now();
        store.update_downstream(&eui, Some(now), Some(now)).unwrap();
        store
            .put_downstream(DownstreamMessage::new(eui, 2, vec![3], false))
            .unwrap();
        assert_eq!(store.get_downstream(&eui).unwrap().port, 2);

        store.delete_downstream(&eui).unwrap();
        assert!(store.get_downstream(&eui).unwrap_err().is_not_found());
        assert!(store
            .update_downstream(&eui, None, None)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_device_data_newest_first() {
        let store = MemoryDataStore::new();
        let eui = Eui::from_u64(1);
        for i in 0..5u8 {
            store
                .put(DeviceData {
                    dev_eui: eui,
                    timestamp: Utc::now(),
                    data: vec![i],
                    gateway_eui: Eui::from_u64(2),
                    rssi: -50,
                    snr: 7.5,
                    frequency: 868.1,
                    data_rate: "SF7BW125".to_string(),
                    dev_addr: DevAddr(1),
                })
                .unwrap();
        }
        let data = store.get_by_device_eui(&eui, 2).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].data, vec![4]);
        assert_eq!(data[1].data, vec![3]);
    }

    #[test]
    fn test_gateway_store() {
        let store = MemoryGatewayStore::new();
        let gw = Gateway {
            gateway_eui: Eui::from_u64(0x42),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            strict_ip: true,
            location: None,
        };
        store.put(gw.clone()).unwrap();
        assert_eq!(store.get(&gw.gateway_eui).unwrap(), gw);
        assert!(store.put(gw).is_err());
    }
}
