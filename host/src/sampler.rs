//! ==============================================================================
//! sampler.rs - per-tick counter reads
//! ==============================================================================
//!
//! purpose:
//!     turns one pass over the registry into a snapshot set.
//!
//! failure isolation:
//!     each of the six reads is independent. a failure blanks only the fields
//!     that read covers, for this device, for this tick. nothing is retried and
//!     nothing is carried over between ticks.
//!
//! relationships:
//!     - uses: hal.rs, registry.rs
//!     - used by: scheduler.rs (on the blocking pool)
//!
//! ==============================================================================

use std::sync::Arc;
use tracing::debug;

use crate::domain::{now_ms, MemoryReading, Snapshot, SnapshotSet, UtilizationReading};
use crate::hal::{BindingError, MetricKind, TelemetrySource};
use crate::registry::{Device, DeviceRegistry};

pub struct Sampler {
    source: Arc<dyn TelemetrySource>,
}

impl Sampler {
    pub fn new(source: Arc<dyn TelemetrySource>) -> Self {
        Self { source }
    }

    /// One snapshot per registered device, in index order.
    pub fn sample_all(&self, registry: &DeviceRegistry, tick: u64) -> SnapshotSet {
        let snapshots = registry
            .devices()
            .iter()
            .map(|device| self.sample_device(device))
            .collect();

        SnapshotSet {
            tick,
            timestamp_ms: now_ms(),
            snapshots,
        }
    }

    pub fn sample_device(&self, device: &Device) -> Snapshot {
        let Some(handle) = device.handle() else {
            debug!(index = device.index, "device was never opened; all metrics unavailable");
            return Snapshot::unavailable(device.index, device.wire_id());
        };
        let source = self.source.as_ref();

        let utilization = field(device, MetricKind::Utilization, source.utilization(handle));
        let memory = field(device, MetricKind::Memory, source.memory_info(handle));

        Snapshot {
            index: device.index,
            id: device.wire_id(),
            utilization: UtilizationReading {
                gpu: utilization.map(|u| u.gpu),
                memory: utilization.map(|u| u.memory),
            },
            memory: MemoryReading {
                total: memory.map(|m| m.total),
                free: memory.map(|m| m.free),
                used: memory.map(|m| m.used),
            },
            temperature: field(device, MetricKind::Temperature, source.temperature(handle)),
            clock: field(device, MetricKind::Clock, source.clock(handle)),
            power_usage: field(device, MetricKind::PowerUsage, source.power_usage(handle)),
            fan_speed: field(device, MetricKind::FanSpeed, source.fan_speed(handle)),
        }
    }
}

fn field<T>(device: &Device, metric: MetricKind, result: Result<T, BindingError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            debug!(index = device.index, %metric, %error, "metric unavailable this tick");
            None
        }
    }
}
