use crate::fts::protocol::DeviceInfo;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDevice {
    pub ip: IpAddr,
    pub name: String,
    pub os: String,
    pub protocol_version: u32,
    pub is_server: bool,
}

impl RemoteDevice {
    pub fn from_info(ip: IpAddr, info: DeviceInfo) -> Self {
        Self {
            ip,
            name: info.name,
            os: info.os,
            protocol_version: info.protocol_version,
            is_server: info.is_server,
        }
    }
}

/// Devices seen on the network, keyed by IP. Entries never expire.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<RemoteDevice>>,
}

impl DeviceRegistry {
    /// Insert or replace the entry for `device.ip`. Returns true when the
    /// device is new or its description changed.
    pub fn upsert(&self, device: RemoteDevice) -> bool {
        let mut devices = self.devices.lock();
        match devices.iter_mut().find(|d| d.ip == device.ip) {
            Some(existing) if *existing == device => false,
            Some(existing) => {
                *existing = device;
                true
            }
            None => {
                devices.push(device);
                true
            }
        }
    }

    pub fn get(&self, ip: IpAddr) -> Option<RemoteDevice> {
        self.devices.lock().iter().find(|d| d.ip == ip).cloned()
    }

    pub fn snapshot(&self) -> Vec<RemoteDevice> {
        self.devices.lock().clone()
    }

    pub fn servers(&self) -> Vec<RemoteDevice> {
        self.devices
            .lock()
            .iter()
            .filter(|d| d.is_server)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(ip: &str, name: &str, is_server: bool) -> RemoteDevice {
        RemoteDevice {
            ip: ip.parse().unwrap(),
            name: name.into(),
            os: "linux".into(),
            protocol_version: 1,
            is_server,
        }
    }

    #[test]
    fn test_upsert_by_ip() {
        let registry = DeviceRegistry::default();
        assert!(registry.upsert(device("10.0.0.2", "wall", false)));
        assert!(!registry.upsert(device("10.0.0.2", "wall", false)));
        assert!(registry.upsert(device("10.0.0.2", "wall-left", true)));
        assert!(registry.upsert(device("10.0.0.3", "kiosk", false)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("10.0.0.2".parse().unwrap()).unwrap().name, "wall-left");
        assert_eq!(registry.servers().len(), 1);
    }
}
