//! ==============================================================================
//! hal.rs - telemetry binding adapter
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for querying accelerator telemetry.
//!     abstracts away the difference between running on a machine with an
//!     NVIDIA driver (using `nvml-wrapper`) and a development machine (mock).
//!
//! design:
//!     - every call returns a value; native status codes become `BindingError`.
//!     - the adapter owns no polling logic and no caching.
//!     - handles are plain indices, so they are `Copy` and free to share. the
//!       nvml backend resolves the native device once per index in `open_device`.
//!
//! relationships:
//!     - used by: registry.rs (enumeration, identity reads)
//!     - used by: sampler.rs (per-tick metric reads)
//!     - uses: nvml-wrapper (on feature="nvml")
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{BackendConfig, BackendKind, MockBackendConfig};

/// Failure of a single native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("telemetry library is not initialized")]
    Uninitialized,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("query not supported by this device")]
    NotSupported,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found")]
    NotFound,
    #[error("timed out")]
    Timeout,
    #[error("driver not loaded")]
    DriverNotLoaded,
    #[error("unknown error (code {0})")]
    Unknown(i32),
}

impl BindingError {
    /// NVML's catch-all return code.
    pub const UNKNOWN_CODE: i32 = 999;

    /// Map a raw NVML return code. `0` is success.
    pub fn from_status(code: i32) -> Result<(), BindingError> {
        match code {
            0 => Ok(()),
            1 => Err(BindingError::Uninitialized),
            2 => Err(BindingError::InvalidArgument),
            3 => Err(BindingError::NotSupported),
            4 => Err(BindingError::PermissionDenied),
            6 => Err(BindingError::NotFound),
            9 => Err(BindingError::DriverNotLoaded),
            10 => Err(BindingError::Timeout),
            other => Err(BindingError::Unknown(other)),
        }
    }
}

/// Opened device. Valid for the lifetime of the source that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

/// PCI location of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PciInfo {
    pub bus_id: String,
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    pub pci_device_id: u32,
}

/// Utilization rates in percent over the last sample period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utilization {
    pub gpu: u32,
    pub memory: u32,
}

/// Framebuffer memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// The counter reads issued for every device on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Utilization,
    Memory,
    Temperature,
    Clock,
    PowerUsage,
    FanSpeed,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Utilization,
        MetricKind::Memory,
        MetricKind::Temperature,
        MetricKind::Clock,
        MetricKind::PowerUsage,
        MetricKind::FanSpeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Utilization => "utilization",
            MetricKind::Memory => "memory",
            MetricKind::Temperature => "temperature",
            MetricKind::Clock => "clock",
            MetricKind::PowerUsage => "power_usage",
            MetricKind::FanSpeed => "fan_speed",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait TelemetrySource: Send + Sync {
    fn initialize(&self) -> Result<(), BindingError>;
    fn device_count(&self) -> Result<u32, BindingError>;
    fn open_device(&self, index: u32) -> Result<DeviceHandle, BindingError>;

    fn name(&self, device: &DeviceHandle) -> Result<String, BindingError>;
    fn uuid(&self, device: &DeviceHandle) -> Result<String, BindingError>;
    fn pci_info(&self, device: &DeviceHandle) -> Result<PciInfo, BindingError>;

    fn utilization(&self, device: &DeviceHandle) -> Result<Utilization, BindingError>;
    fn memory_info(&self, device: &DeviceHandle) -> Result<MemoryInfo, BindingError>;
    /// Core temperature in degrees celsius.
    fn temperature(&self, device: &DeviceHandle) -> Result<u32, BindingError>;
    /// SM clock in MHz.
    fn clock(&self, device: &DeviceHandle) -> Result<u32, BindingError>;
    /// Board power draw in milliwatts.
    fn power_usage(&self, device: &DeviceHandle) -> Result<u32, BindingError>;
    /// Fan speed in percent of maximum.
    fn fan_speed(&self, device: &DeviceHandle) -> Result<u32, BindingError>;
}

/// Build the telemetry source selected in the config.
pub fn from_config(config: &BackendConfig) -> anyhow::Result<Arc<dyn TelemetrySource>> {
    match config.kind {
        BackendKind::Mock => Ok(Arc::new(MockHal::from_config(&config.mock))),
        #[cfg(feature = "nvml")]
        BackendKind::Nvml => Ok(Arc::new(NvmlHal::new())),
        #[cfg(not(feature = "nvml"))]
        BackendKind::Nvml => anyhow::bail!(
            "nvml backend requested but this build has no nvml support; rebuild with --features nvml or set backend.kind = \"mock\""
        ),
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For development machines and tests)
// ==============================================================================================

/// Deterministic in-process device set with injectable failures.
#[derive(Debug)]
pub struct MockHal {
    devices: u32,
    failing_metrics: HashSet<(u32, MetricKind)>,
    failing_identity: HashSet<u32>,
    failing_open: HashMap<u32, BindingError>,
    init_failure: Option<BindingError>,
    initialized: AtomicBool,
    reads: AtomicU64,
}

impl MockHal {
    pub fn new(devices: u32) -> Self {
        Self {
            devices,
            failing_metrics: HashSet::new(),
            failing_identity: HashSet::new(),
            failing_open: HashMap::new(),
            init_failure: None,
            initialized: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &MockBackendConfig) -> Self {
        tracing::info!(devices = config.devices, "Using MOCK HAL (No hardware access)");
        let mut hal = Self::new(config.devices);
        for failing in &config.failing_metrics {
            hal = hal.with_failing_metric(failing.index, failing.metric);
        }
        for &index in &config.failing_identity {
            hal = hal.with_failing_identity(index);
        }
        for &index in &config.failing_open {
            hal = hal.with_failing_open(index, BindingError::NotFound);
        }
        hal
    }

    /// Every read of `kind` on device `index` fails with `NotSupported`.
    pub fn with_failing_metric(mut self, index: u32, kind: MetricKind) -> Self {
        self.failing_metrics.insert((index, kind));
        self
    }

    /// Name, uuid and PCI reads on device `index` fail with `NotSupported`.
    pub fn with_failing_identity(mut self, index: u32) -> Self {
        self.failing_identity.insert(index);
        self
    }

    /// `open_device(index)` fails with `error`.
    pub fn with_failing_open(mut self, index: u32, error: BindingError) -> Self {
        self.failing_open.insert(index, error);
        self
    }

    pub fn with_init_failure(mut self, error: BindingError) -> Self {
        self.init_failure = Some(error);
        self
    }

    fn check_device(&self, device: &DeviceHandle) -> Result<(), BindingError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BindingError::Uninitialized);
        }
        if device.index() >= self.devices {
            return Err(BindingError::InvalidArgument);
        }
        Ok(())
    }

    fn check_identity(&self, device: &DeviceHandle) -> Result<(), BindingError> {
        self.check_device(device)?;
        if self.failing_identity.contains(&device.index()) {
            return Err(BindingError::NotSupported);
        }
        Ok(())
    }

    /// Returns a slowly moving phase so consecutive reads differ.
    fn check_metric(&self, device: &DeviceHandle, kind: MetricKind) -> Result<u64, BindingError> {
        self.check_device(device)?;
        if self.failing_metrics.contains(&(device.index(), kind)) {
            tracing::debug!("[MOCK HAL] device {} {} forced failure", device.index(), kind);
            return Err(BindingError::NotSupported);
        }
        Ok(self.reads.fetch_add(1, Ordering::Relaxed) + u64::from(device.index()) * 7)
    }
}

impl TelemetrySource for MockHal {
    fn initialize(&self) -> Result<(), BindingError> {
        if let Some(error) = self.init_failure {
            return Err(error);
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn device_count(&self) -> Result<u32, BindingError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(BindingError::Uninitialized);
        }
        Ok(self.devices)
    }

    fn open_device(&self, index: u32) -> Result<DeviceHandle, BindingError> {
        let handle = DeviceHandle::new(index);
        self.check_device(&handle)?;
        if let Some(&error) = self.failing_open.get(&index) {
            return Err(error);
        }
        Ok(handle)
    }

    fn name(&self, device: &DeviceHandle) -> Result<String, BindingError> {
        self.check_identity(device)?;
        Ok(format!("Mock GPU {}", device.index()))
    }

    fn uuid(&self, device: &DeviceHandle) -> Result<String, BindingError> {
        self.check_identity(device)?;
        Ok(format!("GPU-00000000-0000-0000-0000-{:012x}", device.index()))
    }

    fn pci_info(&self, device: &DeviceHandle) -> Result<PciInfo, BindingError> {
        self.check_identity(device)?;
        let bus = device.index() + 1;
        Ok(PciInfo {
            bus_id: format!("00000000:{:02X}:00.0", bus),
            domain: 0,
            bus,
            device: device.index(),
            pci_device_id: 0x2684_10de,
        })
    }

    fn utilization(&self, device: &DeviceHandle) -> Result<Utilization, BindingError> {
        let phase = self.check_metric(device, MetricKind::Utilization)?;
        Ok(Utilization {
            gpu: (phase % 101) as u32,
            memory: ((phase * 3) % 101) as u32,
        })
    }

    fn memory_info(&self, device: &DeviceHandle) -> Result<MemoryInfo, BindingError> {
        let phase = self.check_metric(device, MetricKind::Memory)?;
        let total: u64 = 24 * 1024 * 1024 * 1024;
        let used = (phase % 24 + 1) * 1024 * 1024 * 1024 / 2;
        Ok(MemoryInfo {
            total,
            free: total - used,
            used,
        })
    }

    fn temperature(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
        let phase = self.check_metric(device, MetricKind::Temperature)?;
        Ok(40 + (phase % 35) as u32)
    }

    fn clock(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
        let phase = self.check_metric(device, MetricKind::Clock)?;
        Ok(1200 + (phase % 16) as u32 * 50)
    }

    fn power_usage(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
        let phase = self.check_metric(device, MetricKind::PowerUsage)?;
        Ok(60_000 + (phase % 40) as u32 * 5_000)
    }

    fn fan_speed(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
        let phase = self.check_metric(device, MetricKind::FanSpeed)?;
        Ok(30 + (phase % 50) as u32)
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (NVML)
// ==============================================================================================

#[cfg(feature = "nvml")]
pub use nvml_backend::NvmlHal;

#[cfg(feature = "nvml")]
mod nvml_backend {
    use super::*;
    use dashmap::mapref::one::Ref;
    use dashmap::DashMap;
    use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
    use nvml_wrapper::error::NvmlError;
    use nvml_wrapper::{Device, Nvml};
    use std::sync::OnceLock;

    /// Raw NVML return code carried by `error`, or `UNKNOWN_CODE` for
    /// failures raised inside the wrapper itself.
    fn status_code(error: &NvmlError) -> i32 {
        match error {
            NvmlError::Uninitialized => 1,
            NvmlError::InvalidArg => 2,
            NvmlError::NotSupported => 3,
            NvmlError::NoPermission => 4,
            NvmlError::AlreadyInitialized => 5,
            NvmlError::NotFound => 6,
            NvmlError::InsufficientSize(_) => 7,
            NvmlError::InsufficientPower => 8,
            NvmlError::DriverNotLoaded
            | NvmlError::LibraryNotFound
            | NvmlError::LibloadingError(_) => 9,
            NvmlError::Timeout => 10,
            NvmlError::IrqIssue => 11,
            NvmlError::FunctionNotFound => 13,
            NvmlError::GpuLost => 15,
            NvmlError::ResetRequired => 16,
            NvmlError::OperatingSystem => 17,
            NvmlError::LibRmVersionMismatch => 18,
            NvmlError::InUse => 19,
            NvmlError::InsufficientMemory => 20,
            NvmlError::NoData => 21,
            NvmlError::VgpuEccNotSupported => 22,
            NvmlError::InsufficientResources => 23,
            NvmlError::UnexpectedVariant(code) => *code as i32,
            _ => BindingError::UNKNOWN_CODE,
        }
    }

    impl From<NvmlError> for BindingError {
        fn from(error: NvmlError) -> Self {
            match BindingError::from_status(status_code(&error)) {
                Err(mapped) => mapped,
                Ok(()) => BindingError::Unknown(BindingError::UNKNOWN_CODE),
            }
        }
    }

    /// NVML-backed source. `initialize` loads the library once; `open_device`
    /// resolves each device handle once and later reads reuse it.
    #[derive(Default)]
    pub struct NvmlHal {
        nvml: OnceLock<&'static Nvml>,
        devices: DashMap<u32, Device<'static>>,
    }

    impl NvmlHal {
        pub fn new() -> Self {
            tracing::info!("Using NVML HAL (nvml-wrapper)");
            Self::default()
        }

        fn library(&self) -> Result<&'static Nvml, BindingError> {
            self.nvml.get().copied().ok_or(BindingError::Uninitialized)
        }

        fn device(&self, handle: &DeviceHandle) -> Result<Ref<'_, u32, Device<'static>>, BindingError> {
            self.library()?;
            self.devices
                .get(&handle.index())
                .ok_or(BindingError::InvalidArgument)
        }
    }

    impl TelemetrySource for NvmlHal {
        fn initialize(&self) -> Result<(), BindingError> {
            if self.nvml.get().is_none() {
                // opened devices borrow the library for the rest of the process
                let nvml: &'static Nvml = Box::leak(Box::new(Nvml::init()?));
                let _ = self.nvml.set(nvml);
            }
            Ok(())
        }

        fn device_count(&self) -> Result<u32, BindingError> {
            Ok(self.library()?.device_count()?)
        }

        fn open_device(&self, index: u32) -> Result<DeviceHandle, BindingError> {
            let device = self.library()?.device_by_index(index)?;
            self.devices.insert(index, device);
            Ok(DeviceHandle::new(index))
        }

        fn name(&self, device: &DeviceHandle) -> Result<String, BindingError> {
            Ok(self.device(device)?.name()?)
        }

        fn uuid(&self, device: &DeviceHandle) -> Result<String, BindingError> {
            Ok(self.device(device)?.uuid()?)
        }

        fn pci_info(&self, device: &DeviceHandle) -> Result<PciInfo, BindingError> {
            let info = self.device(device)?.pci_info()?;
            Ok(PciInfo {
                bus_id: info.bus_id,
                domain: info.domain,
                bus: info.bus,
                device: info.device,
                pci_device_id: info.pci_device_id,
            })
        }

        fn utilization(&self, device: &DeviceHandle) -> Result<Utilization, BindingError> {
            let rates = self.device(device)?.utilization_rates()?;
            Ok(Utilization {
                gpu: rates.gpu,
                memory: rates.memory,
            })
        }

        fn memory_info(&self, device: &DeviceHandle) -> Result<MemoryInfo, BindingError> {
            let memory = self.device(device)?.memory_info()?;
            Ok(MemoryInfo {
                total: memory.total,
                free: memory.free,
                used: memory.used,
            })
        }

        fn temperature(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
            Ok(self.device(device)?.temperature(TemperatureSensor::Gpu)?)
        }

        fn clock(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
            Ok(self.device(device)?.clock_info(Clock::SM)?)
        }

        fn power_usage(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
            Ok(self.device(device)?.power_usage()?)
        }

        fn fan_speed(&self, device: &DeviceHandle) -> Result<u32, BindingError> {
            Ok(self.device(device)?.fan_speed(0)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, BindingError::Uninitialized)]
    #[case(2, BindingError::InvalidArgument)]
    #[case(3, BindingError::NotSupported)]
    #[case(4, BindingError::PermissionDenied)]
    #[case(6, BindingError::NotFound)]
    #[case(9, BindingError::DriverNotLoaded)]
    #[case(10, BindingError::Timeout)]
    #[case(5, BindingError::Unknown(5))]
    #[case(999, BindingError::Unknown(999))]
    fn status_codes_map_to_typed_errors(#[case] code: i32, #[case] expected: BindingError) {
        assert_eq!(BindingError::from_status(code), Err(expected));
    }

    #[test]
    fn success_code_is_ok() {
        assert_eq!(BindingError::from_status(0), Ok(()));
    }

    #[test]
    fn mock_reads_fail_before_initialize() {
        let hal = MockHal::new(1);
        assert_eq!(hal.device_count(), Err(BindingError::Uninitialized));
        assert_eq!(
            hal.temperature(&DeviceHandle::new(0)),
            Err(BindingError::Uninitialized)
        );
    }

    #[test]
    fn mock_rejects_out_of_range_index() {
        let hal = MockHal::new(2);
        hal.initialize().unwrap();
        assert_eq!(hal.open_device(2), Err(BindingError::InvalidArgument));
        assert!(hal.open_device(1).is_ok());
    }

    #[test]
    fn mock_failure_is_scoped_to_one_device_and_metric() {
        let hal = MockHal::new(2).with_failing_metric(1, MetricKind::Temperature);
        hal.initialize().unwrap();
        let zero = DeviceHandle::new(0);
        let one = DeviceHandle::new(1);

        assert!(hal.temperature(&zero).is_ok());
        assert_eq!(hal.temperature(&one), Err(BindingError::NotSupported));
        assert!(hal.clock(&one).is_ok());
        assert!(hal.fan_speed(&one).is_ok());
    }

    #[test]
    fn mock_memory_is_consistent() {
        let hal = MockHal::new(1);
        hal.initialize().unwrap();
        let memory = hal.memory_info(&DeviceHandle::new(0)).unwrap();
        assert_eq!(memory.free + memory.used, memory.total);
    }

    #[test]
    fn mock_identity_failure_leaves_metrics_alone() {
        let hal = MockHal::new(1).with_failing_identity(0);
        hal.initialize().unwrap();
        let handle = DeviceHandle::new(0);
        assert!(hal.name(&handle).is_err());
        assert!(hal.pci_info(&handle).is_err());
        assert!(hal.utilization(&handle).is_ok());
    }

    #[test]
    fn mock_open_failure_is_reported_for_that_index_only() {
        let hal = MockHal::new(3).with_failing_open(1, BindingError::Unknown(15));
        hal.initialize().unwrap();
        assert!(hal.open_device(0).is_ok());
        assert_eq!(hal.open_device(1), Err(BindingError::Unknown(15)));
        assert!(hal.open_device(2).is_ok());
    }

    #[cfg(feature = "nvml")]
    #[rstest]
    #[case(nvml_wrapper::error::NvmlError::NotSupported, BindingError::NotSupported)]
    #[case(nvml_wrapper::error::NvmlError::DriverNotLoaded, BindingError::DriverNotLoaded)]
    #[case(nvml_wrapper::error::NvmlError::GpuLost, BindingError::Unknown(15))]
    #[case(nvml_wrapper::error::NvmlError::InsufficientPower, BindingError::Unknown(8))]
    #[case(nvml_wrapper::error::NvmlError::Unknown, BindingError::Unknown(999))]
    fn nvml_errors_keep_their_status_code(
        #[case] error: nvml_wrapper::error::NvmlError,
        #[case] expected: BindingError,
    ) {
        assert_eq!(BindingError::from(error), expected);
    }

    #[test]
    fn nvml_without_feature_is_a_config_error() {
        let config = BackendConfig {
            kind: BackendKind::Mock,
            mock: MockBackendConfig::default(),
        };
        assert!(from_config(&config).is_ok());

        #[cfg(not(feature = "nvml"))]
        {
            let config = BackendConfig {
                kind: BackendKind::Nvml,
                mock: MockBackendConfig::default(),
            };
            assert!(from_config(&config).is_err());
        }
    }
}
