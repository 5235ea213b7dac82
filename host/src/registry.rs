//! ==============================================================================
//! registry.rs - device enumeration and static identity
//! ==============================================================================
//!
//! purpose:
//!     enumerates devices once at startup and caches the identity fields that
//!     never change afterwards (name, uuid, pci location).
//!
//! invariants:
//!     - the device set is fixed after `enumerate` returns.
//!     - a device whose open or identity reads fail is still registered, with
//!       those fields unavailable. only init/count failures abort enumeration.
//!     - a device that could not be opened has no handle; every tick reports
//!       it with all fields unavailable.
//!
//! relationships:
//!     - uses: hal.rs (TelemetrySource)
//!     - used by: sampler.rs (device handles), server.rs (roster, /api/devices)
//!
//! ==============================================================================

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{Roster, RosterEntry};
use crate::hal::{BindingError, DeviceHandle, PciInfo, TelemetrySource};

/// Enumeration failed entirely; the host cannot start.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to initialize telemetry library")]
    Initialize(#[source] BindingError),
    #[error("failed to query device count")]
    DeviceCount(#[source] BindingError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub index: u32,
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub pci: Option<PciInfo>,
    #[serde(skip)]
    handle: Option<DeviceHandle>,
}

impl Device {
    /// `None` when the device failed to open at enumeration.
    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.as_ref()
    }

    /// Roster id: the pci device number, or the index when pci info is missing.
    pub fn wire_id(&self) -> u32 {
        self.pci.as_ref().map_or(self.index, |pci| pci.device)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn enumerate(source: &dyn TelemetrySource) -> Result<Self, RegistryError> {
        source.initialize().map_err(RegistryError::Initialize)?;
        let count = source.device_count().map_err(RegistryError::DeviceCount)?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = match source.open_device(index) {
                Ok(handle) => Device {
                    index,
                    name: identity(index, "name", source.name(&handle)),
                    uuid: identity(index, "uuid", source.uuid(&handle)),
                    pci: identity(index, "pci_info", source.pci_info(&handle)),
                    handle: Some(handle),
                },
                Err(error) => {
                    warn!(index, %error, "failed to open device; telemetry unavailable");
                    Device {
                        index,
                        name: None,
                        uuid: None,
                        pci: None,
                        handle: None,
                    }
                }
            };
            info!(
                index,
                name = device.display_name(),
                id = device.wire_id(),
                "registered device"
            );
            devices.push(device);
        }

        if devices.is_empty() {
            warn!("telemetry library reports zero devices");
        }
        Ok(Self { devices })
    }

    pub fn get(&self, index: u32) -> Option<&Device> {
        self.devices.get(index as usize)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn roster(&self) -> Roster {
        Roster {
            devices: self
                .devices
                .iter()
                .map(|device| RosterEntry {
                    id: device.wire_id(),
                    name: device.display_name().to_string(),
                })
                .collect(),
        }
    }
}

fn identity<T>(index: u32, field: &str, result: Result<T, BindingError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(index, field, %error, "identity read failed; field unavailable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockHal;

    #[test]
    fn enumerates_every_device_in_index_order() {
        let registry = DeviceRegistry::enumerate(&MockHal::new(3)).unwrap();
        assert_eq!(registry.len(), 3);
        for (position, device) in registry.devices().iter().enumerate() {
            assert_eq!(device.index as usize, position);
            assert_eq!(device.handle().map(|h| h.index()), Some(device.index));
            assert!(device.name.is_some());
            assert!(device.uuid.is_some());
        }
        assert_eq!(registry.get(2).map(|d| d.index), Some(2));
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn identity_failure_keeps_the_device() {
        let hal = MockHal::new(2).with_failing_identity(1);
        let registry = DeviceRegistry::enumerate(&hal).unwrap();

        assert_eq!(registry.len(), 2);
        let broken = registry.get(1).unwrap();
        assert_eq!(broken.name, None);
        assert_eq!(broken.uuid, None);
        assert_eq!(broken.pci, None);
        assert_eq!(broken.wire_id(), 1);
        assert_eq!(broken.display_name(), "unknown");
    }

    #[test]
    fn open_failure_keeps_the_device_without_a_handle() {
        let hal = MockHal::new(4).with_failing_open(1, BindingError::Unknown(15));
        let registry = DeviceRegistry::enumerate(&hal).unwrap();

        assert_eq!(registry.len(), 4);
        let lost = registry.get(1).unwrap();
        assert!(lost.handle().is_none());
        assert_eq!(lost.name, None);
        assert_eq!(lost.pci, None);
        assert_eq!(lost.wire_id(), 1);
        for index in [0, 2, 3] {
            assert!(registry.get(index).unwrap().handle().is_some());
        }

        let names: Vec<String> = registry.roster().devices.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["Mock GPU 0", "unknown", "Mock GPU 2", "Mock GPU 3"]);
    }

    #[test]
    fn count_failure_is_fatal() {
        struct NoCount;
        impl TelemetrySource for NoCount {
            fn initialize(&self) -> Result<(), BindingError> {
                Ok(())
            }
            fn device_count(&self) -> Result<u32, BindingError> {
                Err(BindingError::Timeout)
            }
            fn open_device(&self, _: u32) -> Result<DeviceHandle, BindingError> {
                unreachable!()
            }
            fn name(&self, _: &DeviceHandle) -> Result<String, BindingError> {
                unreachable!()
            }
            fn uuid(&self, _: &DeviceHandle) -> Result<String, BindingError> {
                unreachable!()
            }
            fn pci_info(&self, _: &DeviceHandle) -> Result<PciInfo, BindingError> {
                unreachable!()
            }
            fn utilization(&self, _: &DeviceHandle) -> Result<crate::hal::Utilization, BindingError> {
                unreachable!()
            }
            fn memory_info(&self, _: &DeviceHandle) -> Result<crate::hal::MemoryInfo, BindingError> {
                unreachable!()
            }
            fn temperature(&self, _: &DeviceHandle) -> Result<u32, BindingError> {
                unreachable!()
            }
            fn clock(&self, _: &DeviceHandle) -> Result<u32, BindingError> {
                unreachable!()
            }
            fn power_usage(&self, _: &DeviceHandle) -> Result<u32, BindingError> {
                unreachable!()
            }
            fn fan_speed(&self, _: &DeviceHandle) -> Result<u32, BindingError> {
                unreachable!()
            }
        }

        let error = DeviceRegistry::enumerate(&NoCount).unwrap_err();
        assert!(matches!(error, RegistryError::DeviceCount(BindingError::Timeout)));
    }

    #[test]
    fn zero_devices_is_not_an_error() {
        let registry = DeviceRegistry::enumerate(&MockHal::new(0)).unwrap();
        assert!(registry.is_empty());
        assert!(registry.roster().devices.is_empty());
    }

    #[test]
    fn init_failure_is_fatal() {
        let hal = MockHal::new(2).with_init_failure(BindingError::DriverNotLoaded);
        let error = DeviceRegistry::enumerate(&hal).unwrap_err();
        assert!(matches!(
            error,
            RegistryError::Initialize(BindingError::DriverNotLoaded)
        ));
    }

    #[test]
    fn roster_uses_pci_device_number() {
        let registry = DeviceRegistry::enumerate(&MockHal::new(2)).unwrap();
        let roster = registry.roster();
        let expected: Vec<u32> = registry
            .devices()
            .iter()
            .map(|d| d.pci.as_ref().unwrap().device)
            .collect();
        let ids: Vec<u32> = roster.devices.iter().map(|e| e.id).collect();
        assert_eq!(ids, expected);
        assert_eq!(roster.devices[0].name, "Mock GPU 0");
    }
}
