//! ==============================================================================
//! domain.rs - snapshot records and wire messages
//! ==============================================================================
//!
//! purpose:
//!     records shared by the sampler, the scheduler and the transport.
//!
//! conventions:
//!     `None` always means "read failed this tick" and serializes as `null`.
//!     a real zero stays `0`.
//!
//! wire format:
//!     {"event": "device-list", "data": {"devices": [{"id", "name"}]}}
//!     {"event": "update", "data": [snapshot, ...]}   dense, in index order
//!
//! ==============================================================================

use serde::Serialize;

/// utilization rates in percent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UtilizationReading {
    pub gpu: Option<u32>,
    pub memory: Option<u32>,
}

/// framebuffer memory in bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryReading {
    pub total: Option<u64>,
    pub free: Option<u64>,
    pub used: Option<u64>,
}

/// one device's reading for one tick
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// position in the registry; implied by array order on the wire
    #[serde(skip)]
    pub index: u32,
    /// roster id (pci device number)
    pub id: u32,
    pub utilization: UtilizationReading,
    pub memory: MemoryReading,
    /// degrees celsius
    pub temperature: Option<u32>,
    /// sm clock in MHz
    pub clock: Option<u32>,
    /// milliwatts
    pub power_usage: Option<u32>,
    /// percent
    pub fan_speed: Option<u32>,
}

impl Snapshot {
    /// A record with every field unavailable.
    pub fn unavailable(index: u32, id: u32) -> Self {
        Self {
            index,
            id,
            ..Self::default()
        }
    }

    /// Number of fields that failed to read.
    pub fn unavailable_fields(&self) -> usize {
        [
            self.utilization.gpu.is_none(),
            self.utilization.memory.is_none(),
            self.memory.total.is_none(),
            self.memory.free.is_none(),
            self.memory.used.is_none(),
            self.temperature.is_none(),
            self.clock.is_none(),
            self.power_usage.is_none(),
            self.fan_speed.is_none(),
        ]
        .iter()
        .filter(|missing| **missing)
        .count()
    }
}

/// every device's snapshot for one tick, in device-index order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSet {
    /// monotonic tick sequence number, starting at 1
    pub tick: u64,
    /// unix timestamp (ms) when sampling finished
    pub timestamp_ms: u64,
    pub snapshots: Vec<Snapshot>,
}

impl SnapshotSet {
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RosterEntry {
    pub id: u32,
    pub name: String,
}

/// device list sent to every subscriber on connect
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Roster {
    pub devices: Vec<RosterEntry>,
}

/// messages pushed over the WebSocket, framed as `{"event": .., "data": ..}`
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage<'a> {
    DeviceList(&'a Roster),
    Update(&'a [Snapshot]),
}

impl ServerMessage<'_> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// current unix time in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn unavailable_is_null_and_zero_is_zero() {
        let mut snapshot = Snapshot::unavailable(0, 4);
        snapshot.temperature = Some(0);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["temperature"], json!(0));
        assert_eq!(value["fanSpeed"], Value::Null);
        assert_eq!(value["utilization"]["gpu"], Value::Null);
        assert_eq!(value["id"], json!(4));
        assert!(value.get("index").is_none());
    }

    #[test]
    fn snapshot_uses_dashboard_field_names() {
        let value = serde_json::to_value(Snapshot::default()).unwrap();
        let object = value.as_object().unwrap();
        for key in ["id", "utilization", "memory", "temperature", "clock", "powerUsage", "fanSpeed"] {
            assert!(object.contains_key(key), "missing {key}");
        }
        let memory = value["memory"].as_object().unwrap();
        for key in ["total", "free", "used"] {
            assert!(memory.contains_key(key), "missing memory.{key}");
        }
    }

    #[test]
    fn unavailable_fields_counts_every_leaf() {
        assert_eq!(Snapshot::unavailable(0, 0).unavailable_fields(), 9);

        let mut snapshot = Snapshot::unavailable(0, 0);
        snapshot.clock = Some(1500);
        snapshot.memory.used = Some(1);
        assert_eq!(snapshot.unavailable_fields(), 7);
    }

    #[test]
    fn device_list_message_framing() {
        let roster = Roster {
            devices: vec![RosterEntry {
                id: 1,
                name: "Mock GPU 0".into(),
            }],
        };
        let text = ServerMessage::DeviceList(&roster).to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"event": "device-list", "data": {"devices": [{"id": 1, "name": "Mock GPU 0"}]}})
        );
    }

    #[test]
    fn update_message_is_an_array() {
        let snapshots = vec![Snapshot::unavailable(0, 0), Snapshot::unavailable(1, 3)];
        let text = ServerMessage::Update(&snapshots).to_json().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "update");
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
        assert_eq!(value["data"][1]["id"], 3);
    }

    #[test]
    fn empty_update_is_empty_array() {
        let text = ServerMessage::Update(&[]).to_json().unwrap();
        assert_eq!(text, r#"{"event":"update","data":[]}"#);
    }
}
