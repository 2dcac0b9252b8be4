//! Configuration bridge (C7): translates between the persisted document and
//! the in-memory device table, plus the broadcast target list derived from
//! the document's `net` entries. Persistence itself is delegated to a
//! [`ConfigStore`] so the bridge stays testable without touching a filesystem.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceKey, DeviceRecord, DeviceTable};
use crate::event::{DeviceEvent, EventChannel};

/// A single `get_sysinfo` broadcast destination. Index 0 is always the
/// implicit limited-broadcast address; entries beyond it come from the
/// document's `net` list, each resolved once at reload time.
#[derive(Debug, Clone)]
pub struct BroadcastTarget {
    pub name: Option<String>,
    pub addr: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceEntry {
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KasaSection {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    /// Extra broadcast targets beyond the implicit limited-broadcast address,
    /// given as hostnames or literal IPv4 addresses.
    #[serde(default)]
    pub net: Vec<String>,
}

/// The persisted shape: a `kasa` section nested the way the teacher's
/// `automation_lib::config` nests per-device sections under their own key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KasaDocument {
    pub kasa: KasaSection,
}

impl KasaDocument {
    pub fn from_json(text: &str) -> Result<Self, crate::error::ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("KasaDocument always serializes")
    }
}

/// Rebuilds a device table from a document alone, discarding any
/// discovery-only records. This is a full re-seat, not a merge: a config
/// reload intentionally forgets everything that was only ever seen over the
/// wire, matching the original's reset-then-repopulate reload behavior.
pub fn build_table(document: &KasaDocument) -> IndexMap<DeviceKey, DeviceRecord> {
    let mut devices = IndexMap::new();
    for entry in &document.kasa.devices {
        let key = DeviceKey::new(entry.id.clone(), entry.child.clone());
        if devices.contains_key(&key) {
            // Duplicate key within the document itself; first entry wins.
            continue;
        }
        let record = DeviceRecord::from_config(
            key.clone(),
            entry.name.clone(),
            entry.model.clone(),
            entry.description.clone(),
        );
        devices.insert(key, record);
    }
    devices
}

/// Serializes the current table and broadcast target list back into a
/// document, in the same field order `build_table` expects on the way in.
pub fn export_document(table: &DeviceTable, targets: &[BroadcastTarget]) -> KasaDocument {
    let devices = table
        .iter()
        .map(|(_, record)| DeviceEntry {
            name: record.name.clone(),
            id: record.key.device_id.clone(),
            child: record.key.child_id.clone(),
            model: record.model.clone(),
            description: record.description.clone(),
        })
        .collect();
    let net = targets
        .iter()
        .filter_map(|target| target.name.clone())
        .collect();
    KasaDocument {
        kasa: KasaSection { devices, net },
    }
}

/// Resolves the document's `net` list into concrete broadcast targets,
/// always prepending the implicit limited-broadcast address at index 0.
/// Hosts that fail to resolve are dropped with a warning rather than
/// failing the whole reload.
pub async fn resolve_targets(net: &[String], events: &EventChannel) -> Vec<BroadcastTarget> {
    let mut targets = vec![BroadcastTarget {
        name: None,
        addr: Ipv4Addr::BROADCAST,
    }];

    for host in net {
        match resolve_ipv4(host).await {
            Some(addr) => {
                events.emit(DeviceEvent::new(
                    "NETWORK",
                    host.clone(),
                    "ADDED",
                    format!("broadcast target at {addr}"),
                ));
                targets.push(BroadcastTarget {
                    name: Some(host.clone()),
                    addr,
                });
            }
            None => {
                tracing::warn!(host, "could not resolve configured broadcast target");
            }
        }
    }

    targets
}

async fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Some(addr);
    }
    let addrs = tokio::net::lookup_host((host, 0)).await.ok()?;
    addrs.into_iter().find_map(|addr| match addr.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

/// Where the document lives and how it moves to and from durable storage.
/// `FileConfigStore` is the production implementation; tests substitute an
/// in-memory one.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> io::Result<Option<String>>;
    fn save(&self, document: &str) -> io::Result<()>;
}

pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> io::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&self, document: &str) -> io::Result<()> {
        std::fs::write(&self.path, document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_document() -> KasaDocument {
        KasaDocument {
            kasa: KasaSection {
                devices: vec![
                    DeviceEntry {
                        name: "Lamp".into(),
                        id: "AAA".into(),
                        child: None,
                        model: Some("HS100".into()),
                        description: None,
                    },
                    DeviceEntry {
                        name: "Strip Left".into(),
                        id: "BBB".into(),
                        child: Some("00".into()),
                        model: None,
                        description: Some("office strip".into()),
                    },
                ],
                net: vec!["kasa-bridge.local".into()],
            },
        }
    }

    #[test]
    fn build_table_populates_from_document() {
        let devices = build_table(&sample_document());
        assert_eq!(devices.len(), 2);
        let lamp = &devices[&DeviceKey::new("AAA", None)];
        assert_eq!(lamp.name, "Lamp");
        assert_eq!(lamp.model.as_deref(), Some("HS100"));
        assert!(lamp.is_silent());
    }

    #[test]
    fn build_table_skips_duplicate_keys_within_document() {
        let mut document = sample_document();
        document.kasa.devices.push(DeviceEntry {
            name: "Lamp Again".into(),
            id: "AAA".into(),
            child: None,
            model: None,
            description: None,
        });
        let devices = build_table(&document);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[&DeviceKey::new("AAA", None)].name, "Lamp");
    }

    #[test]
    fn export_round_trips_through_build_table() {
        let document = sample_document();
        let mut table = DeviceTable::new();
        table.replace(build_table(&document));
        let targets = vec![
            BroadcastTarget {
                name: None,
                addr: Ipv4Addr::BROADCAST,
            },
            BroadcastTarget {
                name: Some("kasa-bridge.local".into()),
                addr: Ipv4Addr::new(10, 0, 0, 5),
            },
        ];

        let exported = export_document(&table, &targets);
        assert_eq!(exported.kasa.net, vec!["kasa-bridge.local".to_string()]);

        let rebuilt = build_table(&exported);
        assert_eq!(rebuilt.len(), table.len());
        assert_eq!(
            rebuilt[&DeviceKey::new("BBB", Some("00".into()))]
                .description
                .as_deref(),
            Some("office strip")
        );
    }

    #[test]
    fn file_config_store_returns_none_for_missing_file() {
        let store = FileConfigStore::new("/nonexistent/path/kasa.json");
        assert!(store.load().unwrap().is_none());
    }
}
