//! The device table (C3): one record per controllable outlet, keyed by the
//! pair that uniquely identifies a control point on the Kasa wire protocol.

use std::net::SocketAddrV4;

use indexmap::IndexMap;
use thiserror::Error;

/// Sanity cap on the number of tracked control points. The original grows a
/// realloc'd array and reports `TableFull` once its headroom runs out; we
/// don't need a fixed allocation in Rust, but we keep a cap so `TableFull`
/// stays a reachable, testable error rather than dead code.
pub const MAX_DEVICES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub device_id: String,
    pub child_id: Option<String>,
}

impl DeviceKey {
    pub fn new(device_id: impl Into<String>, child_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            child_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub name: String,
    pub key: DeviceKey,
    pub model: Option<String>,
    pub description: Option<String>,
    pub address: Option<SocketAddrV4>,
    /// 0 means never detected / currently silent.
    pub detected: u64,
    pub last_sense: u64,
    pub status: bool,
    pub commanded: bool,
    /// 0 means no command outstanding.
    pub pending: u64,
    /// 0 means no pulse in effect.
    pub deadline: u64,
}

impl DeviceRecord {
    fn new(key: DeviceKey, name: String, model: Option<String>) -> Self {
        Self {
            name,
            key,
            model,
            description: None,
            address: None,
            detected: 0,
            last_sense: 0,
            status: false,
            commanded: false,
            pending: 0,
            deadline: 0,
        }
    }

    /// Builds a freshly zeroed record from a persisted config entry - used by
    /// the configuration bridge when it re-seats the table on reload.
    pub fn from_config(
        key: DeviceKey,
        name: String,
        model: Option<String>,
        description: Option<String>,
    ) -> Self {
        let mut record = Self::new(key, name, model);
        record.description = description;
        record
    }

    pub fn is_silent(&self) -> bool {
        self.detected == 0
    }

    /// Updates the address only when it actually changed, mirroring the
    /// original's `housekasa_device_refresh_string`-style skip-if-unchanged helpers.
    pub fn update_address(&mut self, addr: SocketAddrV4) {
        if self.address != Some(addr) {
            self.address = Some(addr);
        }
    }

    /// Seeds `model` only if it was never set, leaving an operator-entered
    /// value alone.
    pub fn seed_model_if_empty(&mut self, model: &Option<String>) {
        if self.model.is_none() {
            if let Some(model) = model {
                self.model = Some(model.clone());
            }
        }
    }

    /// `commanded == status == to; pending == deadline == 0`.
    pub fn reset(&mut self, to: bool) {
        self.commanded = to;
        self.status = to;
        self.pending = 0;
        self.deadline = 0;
    }
}

#[derive(Debug, Error)]
pub enum TableFull {
    #[error("device table is full ({max} entries), ignoring new device '{id}'")]
    Full { max: usize, id: String },
}

#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: IndexMap<DeviceKey, DeviceRecord>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            devices: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get_by_key(&self, key: &DeviceKey) -> Option<&DeviceRecord> {
        self.devices.get(key)
    }

    /// Child-sensitive lookup: `(id, None)` is distinct from `(id, Some(child))`.
    pub fn find_by_id(&self, device_id: &str, child_id: Option<&str>) -> Option<usize> {
        self.devices.get_index_of(&DeviceKey::new(
            device_id,
            child_id.map(|c| c.to_string()),
        ))
    }

    /// First record whose last-known address matches. Only used to correlate
    /// set-relay acks with a device, since the ack carries no device identity.
    pub fn find_by_address(&self, addr: SocketAddrV4) -> Option<usize> {
        self.devices
            .values()
            .position(|d| d.address == Some(addr))
    }

    pub fn add(
        &mut self,
        key: DeviceKey,
        name: String,
        model: Option<String>,
    ) -> Result<usize, TableFull> {
        if self.devices.len() >= MAX_DEVICES {
            return Err(TableFull::Full {
                max: MAX_DEVICES,
                id: key.device_id,
            });
        }
        let record = DeviceRecord::new(key.clone(), name, model);
        let (index, _previous) = self.devices.insert_full(key, record);
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<&DeviceRecord> {
        self.devices.get_index(index).map(|(_, record)| record)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceRecord> {
        self.devices
            .get_index_mut(index)
            .map(|(_, record)| record)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &DeviceRecord)> {
        self.devices.values().enumerate()
    }

    /// Every index whose record carries this name. Names are never required
    /// to be unique (only `(deviceId, childId)` is, per the table's
    /// uniqueness invariant) - two child outlets on the same device, or two
    /// independently configured devices, may legally share a name.
    pub fn find_by_name(&self, name: &str) -> Vec<usize> {
        self.devices
            .values()
            .enumerate()
            .filter(|(_, d)| d.name == name)
            .map(|(index, _)| index)
            .collect()
    }

    /// Replaces the entire table, used by the configuration bridge to
    /// re-seat the set of records on a config reload.
    pub fn replace(&mut self, devices: IndexMap<DeviceKey, DeviceRecord>) {
        self.devices = devices;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, child: Option<&str>) -> DeviceKey {
        DeviceKey::new(id, child.map(|c| c.to_string()))
    }

    #[test]
    fn find_by_id_is_child_sensitive() {
        let mut table = DeviceTable::new();
        let parent = table
            .add(key("AAA", None), "Lamp".into(), None)
            .unwrap();
        let child = table
            .add(key("AAA", Some("00")), "Left".into(), None)
            .unwrap();

        assert_eq!(table.find_by_id("AAA", None), Some(parent));
        assert_eq!(table.find_by_id("AAA", Some("00")), Some(child));
        assert_eq!(table.find_by_id("AAA", Some("01")), None);
    }

    #[test]
    fn indices_are_stable_insertion_order() {
        let mut table = DeviceTable::new();
        let a = table.add(key("AAA", None), "A".into(), None).unwrap();
        let b = table.add(key("BBB", None), "B".into(), None).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(table.get(0).unwrap().key.device_id, "AAA");
        assert_eq!(table.get(1).unwrap().key.device_id, "BBB");
    }

    #[test]
    fn table_full_is_reachable() {
        let mut table = DeviceTable::new();
        for i in 0..MAX_DEVICES {
            table
                .add(key(&format!("D{i}"), None), format!("D{i}"), None)
                .unwrap();
        }
        let err = table
            .add(key("overflow", None), "overflow".into(), None)
            .unwrap_err();
        assert!(matches!(err, TableFull::Full { .. }));
    }

    #[test]
    fn uniqueness_invariant_on_key_collision() {
        let mut table = DeviceTable::new();
        table.add(key("AAA", None), "A".into(), None).unwrap();
        // Re-adding the same key overwrites rather than duplicating (IndexMap
        // semantics); the table never contains two records with the same key.
        table.add(key("AAA", None), "A2".into(), None).unwrap();
        assert_eq!(table.len(), 1);
    }
}
