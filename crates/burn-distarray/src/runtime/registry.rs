use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::{DeviceId, DeviceRuntime};
use crate::DistConfig;
use crate::error::{OrFatal, fatal};

/// Stream and begin/end events dedicated to one device.
pub struct DeviceResources<R: DeviceRuntime> {
    /// Stream kernels for this device are queued on.
    pub stream: R::Stream,
    /// Recorded right before each launch.
    pub begin: R::Event,
    /// Recorded right after each launch.
    pub end: R::Event,
}

impl<R: DeviceRuntime> Clone for DeviceResources<R> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            begin: self.begin.clone(),
            end: self.end.clone(),
        }
    }
}

/// Explicit owner of the device runtime and of the per-device resource pool.
///
/// Streams and events are created lazily the first time a device index is
/// used and are kept for the lifetime of the registry. Build one registry per
/// process and hand it to every storage and launcher.
pub struct DeviceRegistry<R: DeviceRuntime> {
    runtime: Arc<R>,
    config: DistConfig,
    resources: Mutex<Vec<DeviceResources<R>>>,
}

impl<R: DeviceRuntime> DeviceRegistry<R> {
    /// Creates a registry over `runtime` with the default configuration.
    pub fn new(runtime: R) -> Arc<Self> {
        Self::with_config(runtime, DistConfig::default())
    }

    /// Creates a registry over `runtime`.
    ///
    /// An invalid configuration is fatal.
    pub fn with_config(runtime: R, config: DistConfig) -> Arc<Self> {
        config.validate().or_fatal("invalid distribution config");
        Arc::new(Self {
            runtime: Arc::new(runtime),
            config,
            resources: Mutex::new(Vec::new()),
        })
    }

    /// The device runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Shared handle to the device runtime, for work that outlives a borrow.
    pub fn runtime_handle(&self) -> Arc<R> {
        self.runtime.clone()
    }

    /// The configuration shared by everything built from this registry.
    pub fn config(&self) -> &DistConfig {
        &self.config
    }

    /// Devices usable by storages and launchers.
    pub fn device_count(&self) -> usize {
        let installed = self.runtime.device_count();
        match self.config.max_devices {
            Some(max) => installed.min(max),
            None => installed,
        }
    }

    /// Number of devices whose resources have been created.
    pub fn initialized_devices(&self) -> usize {
        self.resources.lock().len()
    }

    /// Creates the resources of devices `0..devices` that do not exist yet.
    pub fn init_devices(&self, devices: usize) {
        let mut resources = self.resources.lock();
        for device in resources.len()..devices {
            self.runtime
                .set_device(device)
                .or_fatal("cannot select device");
            let stream = self
                .runtime
                .create_stream()
                .or_fatal("cannot create stream");
            let begin = self.runtime.create_event().or_fatal("cannot create event");
            let end = self.runtime.create_event().or_fatal("cannot create event");
            log::debug!("Registry> created stream and events for device {device}");
            resources.push(DeviceResources { stream, begin, end });
        }
    }

    /// Resources of `device`, creating them (and those of lower devices) if needed.
    pub fn resources(&self, device: DeviceId) -> DeviceResources<R> {
        self.init_devices(device + 1);
        match self.resources.lock().get(device) {
            Some(resources) => resources.clone(),
            None => fatal!("no resources for device {device}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::{SimOp, SimRuntime};

    #[test]
    fn test_resources_are_created_lazily_and_kept() {
        let registry = DeviceRegistry::new(SimRuntime::new(4));
        assert_eq!(registry.initialized_devices(), 0);

        registry.init_devices(2);
        assert_eq!(registry.initialized_devices(), 2);

        let first = registry.resources(1);
        let again = registry.resources(1);
        assert_eq!(first.stream, again.stream);
        assert_eq!(first.end, again.end);

        registry.init_devices(1);
        assert_eq!(registry.initialized_devices(), 2);

        let streams = registry
            .runtime()
            .trace()
            .iter()
            .filter(|op| matches!(op, SimOp::CreateStream { .. }))
            .count();
        assert_eq!(streams, 2);
    }

    #[test]
    fn test_streams_belong_to_their_device() {
        let registry = DeviceRegistry::new(SimRuntime::new(3));

        let resources = registry.resources(2);

        assert_eq!(registry.initialized_devices(), 3);
        assert_eq!(resources.stream.device(), 2);
        assert_eq!(resources.begin.device(), 2);
    }

    #[test]
    fn test_device_count_is_capped() {
        let config = DistConfig::default().with_max_devices(2);
        let registry = DeviceRegistry::with_config(SimRuntime::new(4), config);

        assert_eq!(registry.device_count(), 2);
    }

    #[test]
    #[should_panic = "invalid distribution config"]
    fn test_invalid_config_is_fatal() {
        let config = DistConfig::default().with_granule_bytes(1000);
        let _registry = DeviceRegistry::with_config(SimRuntime::new(1), config);
    }

    #[test]
    #[should_panic = "cannot select device"]
    fn test_unknown_device_is_fatal() {
        let registry = DeviceRegistry::new(SimRuntime::new(1));
        registry.resources(1);
    }
}
