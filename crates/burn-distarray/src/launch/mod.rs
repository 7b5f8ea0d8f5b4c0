//! Multi-device kernel dispatch.
//!
//! A launch splits its compute grid over the same device mesh the arrays it
//! touches were distributed with, and runs one kernel per device on that
//! device's stream:
//!
//! 1. every participating device is drained;
//! 2. coherent arguments are released once with the list of active devices;
//! 3. each non-empty slot is launched between a begin and an end event;
//! 4. completion waits on the end events in device order, then acquires the
//!    coherent arguments.
//!
//! [`launch`] performs step 4 before returning. [`launch_async`] defers it to
//! a [`LaunchHandle`].

mod args;
mod tiling;

pub use args::*;
pub use tiling::*;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::{Future, IntoFuture};
use core::pin::Pin;
use std::panic::{self, AssertUnwindSafe};

use async_channel::Receiver;
use derive_new::new;

use crate::error::{OrFatal, fatal};
use crate::runtime::{DeviceId, DeviceRegistry, DeviceRuntime, Dim3, LaunchConfig};
use crate::sharding::{ComputeConf, DeviceMesh, resolve_procs};

/// Global geometry of a kernel launch.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridConfig<const DC: usize> {
    /// Blocks along each compute axis, highest-order first.
    pub grid: [usize; DC],
    /// Threads per block.
    pub block: Dim3,
    /// Dynamic shared memory per block, in bytes.
    #[new(default)]
    pub shared_mem: usize,
}

impl<const DC: usize> GridConfig<DC> {
    /// Sets the dynamic shared memory per block.
    pub fn with_shared_mem(mut self, shared_mem: usize) -> Self {
        self.shared_mem = shared_mem;
        self
    }
}

/// Issues the per-device launches shared by the blocking and deferred launchers.
struct Dispatcher<'k, R: DeviceRuntime, const DC: usize> {
    registry: Arc<DeviceRegistry<R>>,
    kernel: &'k R::Kernel,
    name: String,
    conf: GridConfig<DC>,
    devices: usize,
    plan: TilePlan<DC>,
    transpose_xy: bool,
}

impl<'k, R: DeviceRuntime, const DC: usize> Dispatcher<'k, R, DC> {
    fn new(
        registry: &Arc<DeviceRegistry<R>>,
        kernel: &'k R::Kernel,
        name: &str,
        conf: GridConfig<DC>,
        comp: ComputeConf<DC>,
    ) -> Self {
        let devices = resolve_procs(comp.procs, registry.device_count());
        registry.init_devices(devices);

        let mesh = DeviceMesh::for_compute(&comp.with_procs(devices));
        let plan = TilePlan::new(conf.grid, mesh);

        Self {
            registry: registry.clone(),
            kernel,
            name: name.into(),
            conf,
            devices,
            plan,
            transpose_xy: false,
        }
    }

    /// Launches every non-empty slot and returns the devices that run one.
    fn execute(&self, args: &KernelArgs<'_>) -> Vec<DeviceId> {
        let runtime = self.registry.runtime();

        log::debug!("Launch> {}: devices: {}", self.name, self.devices);
        log::debug!("Launch> orig: {:?}", self.plan.global());
        log::debug!("Launch> step: {:?}", self.plan.step());

        for device in 0..self.devices {
            runtime.set_device(device).or_fatal("cannot select device");
            runtime
                .synchronize_device()
                .or_fatal("cannot drain device");
        }

        let slots: Vec<_> = self
            .plan
            .slots()
            .into_iter()
            .filter(|slot| !slot.is_empty())
            .collect();

        let mut active = Vec::with_capacity(slots.len());
        for slot in &slots {
            runtime
                .set_device(slot.device)
                .or_fatal("cannot select device");
            active.push(slot.device);
        }

        for (coherent, is_const) in args.coherent() {
            coherent.release(&active, *is_const);
        }

        let global_grid = Dim3::from_axes(self.plan.global(), 1);
        for slot in &slots {
            let resources = self.registry.resources(slot.device);
            runtime
                .set_device(slot.device)
                .or_fatal("cannot select device");

            let mut grid = Dim3::from_axes(&slot.local, 1);
            if self.transpose_xy {
                core::mem::swap(&mut grid.x, &mut grid.y);
            }
            let offset = Dim3::from_axes(&slot.offset, 0);
            log::debug!(
                "Launch> device {} {:?}: grid {grid:?} offset {offset:?}",
                slot.device,
                slot.coords
            );

            for (coherent, _) in args.coherent() {
                coherent.set_current_device(slot.device);
            }

            let config = LaunchConfig::new(
                grid,
                self.conf.block,
                self.conf.shared_mem,
                global_grid,
                offset,
            );
            runtime
                .record_event(&resources.begin, &resources.stream)
                .or_fatal("cannot record begin event");
            runtime
                .launch_kernel(self.kernel, &config, args.params(), &resources.stream)
                .unwrap_or_else(|err| fatal!("cannot launch {}: {err}", self.name));
            runtime
                .record_event(&resources.end, &resources.stream)
                .or_fatal("cannot record end event");
        }

        active
    }
}

/// Blocks until every active device is done, then acquires the coherent arguments.
fn wait<R: DeviceRuntime>(
    registry: &DeviceRegistry<R>,
    active: &[DeviceId],
    coherent: &[CoherentArg],
) -> bool {
    for device in active {
        let resources = registry.resources(*device);
        registry
            .runtime()
            .synchronize_event(&resources.end)
            .or_fatal("cannot wait for device");
    }

    for (coherent, _) in coherent {
        coherent.acquire();
    }

    true
}

/// Runs [`wait`] and turns a fatal error into the message it panicked with.
fn wait_catching<R: DeviceRuntime>(
    registry: &DeviceRegistry<R>,
    active: &[DeviceId],
    coherent: &[CoherentArg],
) -> Result<bool, String> {
    panic::catch_unwind(AssertUnwindSafe(|| wait(registry, active, coherent))).map_err(|payload| {
        match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => String::from(*message),
                Err(_) => String::from("unknown panic"),
            },
        }
    })
}

/// Blocking launcher returned by [`launch`].
pub struct Launcher<'k, R: DeviceRuntime, const DC: usize> {
    dispatcher: Dispatcher<'k, R, DC>,
}

impl<R: DeviceRuntime, const DC: usize> Launcher<'_, R, DC> {
    /// Swaps the `x` and `y` extents of every local grid.
    pub fn transpose_xy(mut self) -> Self {
        self.dispatcher.transpose_xy = true;
        self
    }

    /// Runs the kernel on every device and waits for it to finish.
    pub fn call(&self, args: KernelArgs<'_>) -> bool {
        let active = self.dispatcher.execute(&args);
        wait(&*self.dispatcher.registry, &active, args.coherent())
    }
}

/// Deferred launcher returned by [`launch_async`].
pub struct AsyncLauncher<'k, R: DeviceRuntime, const DC: usize> {
    dispatcher: Dispatcher<'k, R, DC>,
}

impl<R: DeviceRuntime, const DC: usize> AsyncLauncher<'_, R, DC> {
    /// Swaps the `x` and `y` extents of every local grid.
    pub fn transpose_xy(mut self) -> Self {
        self.dispatcher.transpose_xy = true;
        self
    }

    /// Runs the kernel on every device and returns without waiting.
    ///
    /// Completion is tracked on a background thread. The coherent arguments
    /// are only acquired once the handle reports completion, so results must
    /// not be read before the handle has been awaited. A fatal error on the
    /// completion thread aborts the process.
    pub fn call(&self, args: KernelArgs<'_>) -> LaunchHandle {
        let active = self.dispatcher.execute(&args);
        let coherent = args.coherent().to_vec();
        let registry = self.dispatcher.registry.clone();
        let name = self.dispatcher.name.clone();
        let (sender, receiver) = async_channel::bounded(1);

        std::thread::Builder::new()
            .name(format!("distarray-wait-{name}"))
            .spawn(move || match wait_catching(&*registry, &active, &coherent) {
                Ok(done) => {
                    if sender.send_blocking(done).is_err() {
                        log::debug!("Launch> completion handle dropped before the launch finished");
                    }
                }
                Err(message) => {
                    log::error!("Launch> {name}: completion failed: {message}");
                    std::process::abort()
                }
            })
            .or_fatal("cannot spawn completion thread");

        LaunchHandle { receiver }
    }
}

/// Completion of a deferred launch.
///
/// Await it, or call [`wait`](LaunchHandle::wait), before relying on the
/// results of the kernel.
#[must_use = "the coherent arguments are only acquired once the launch is awaited"]
pub struct LaunchHandle {
    receiver: Receiver<bool>,
}

impl LaunchHandle {
    /// Blocks the calling thread until the launch has completed.
    pub fn wait(self) -> bool {
        futures_lite::future::block_on(self.into_future())
    }
}

impl IntoFuture for LaunchHandle {
    type Output = bool;
    type IntoFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match self.receiver.recv().await {
                Ok(done) => done,
                Err(_) => fatal!("launch completion task ended without reporting"),
            }
        })
    }
}

/// Prepares a blocking launch of `kernel` over `conf.grid`, split as `comp` says.
pub fn launch<'k, R: DeviceRuntime, const DC: usize>(
    registry: &Arc<DeviceRegistry<R>>,
    kernel: &'k R::Kernel,
    name: &str,
    conf: GridConfig<DC>,
    comp: ComputeConf<DC>,
) -> Launcher<'k, R, DC> {
    Launcher {
        dispatcher: Dispatcher::new(registry, kernel, name, conf, comp),
    }
}

/// Prepares a deferred launch of `kernel` over `conf.grid`, split as `comp` says.
pub fn launch_async<'k, R: DeviceRuntime, const DC: usize>(
    registry: &Arc<DeviceRegistry<R>>,
    kernel: &'k R::Kernel,
    name: &str,
    conf: GridConfig<DC>,
    comp: ComputeConf<DC>,
) -> AsyncLauncher<'k, R, DC> {
    AsyncLauncher {
        dispatcher: Dispatcher::new(registry, kernel, name, conf, comp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::{SimKernel, SimLaunch, SimOp, SimRuntime};
    use spin::Mutex;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    impl Journal {
        fn push(&self, entry: String) {
            self.entries.lock().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.entries.lock().clone()
        }
    }

    impl Coherent for Journal {
        fn release(&self, devices: &[DeviceId], is_const: bool) {
            self.push(format!("release {devices:?} {is_const}"));
        }

        fn acquire(&self) {
            self.push("acquire".into());
        }

        fn set_current_device(&self, device: DeviceId) {
            self.push(format!("current {device}"));
        }
    }

    fn journaling_kernel(journal: &Arc<Journal>) -> SimKernel {
        let journal = journal.clone();
        SimKernel::new("journal", move |_: &SimRuntime, launch: &SimLaunch<'_>| {
            journal.push(format!(
                "launch {} {} {}",
                launch.device, launch.config.offset.x, launch.config.global_grid.x
            ));
        })
    }

    fn launches(trace: &[SimOp]) -> Vec<(DeviceId, Dim3, Dim3)> {
        trace
            .iter()
            .filter_map(|op| match op {
                SimOp::Launch {
                    device,
                    grid,
                    offset,
                    ..
                } => Some((*device, *grid, *offset)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_blocking_launch_trace() {
        let registry = DeviceRegistry::new(SimRuntime::new(2));
        let kernel = SimKernel::noop("noop");
        let n = 64u32;

        let launcher = launch(
            &registry,
            &kernel,
            "noop",
            GridConfig::new([64], Dim3::new(128, 1, 1)),
            ComputeConf::new([true], 2),
        );
        registry.runtime().clear_trace();

        assert!(launcher.call(KernelArgs::new().arg(&n)));

        let launch = |device, offset| SimOp::Launch {
            device,
            kernel: "noop".into(),
            grid: Dim3::new(32, 1, 1),
            offset: Dim3::new(offset, 0, 0),
            params: 1,
        };
        assert_eq!(
            registry.runtime().trace(),
            vec![
                SimOp::SetDevice(0),
                SimOp::SyncDevice(0),
                SimOp::SetDevice(1),
                SimOp::SyncDevice(1),
                SimOp::SetDevice(0),
                SimOp::SetDevice(1),
                SimOp::SetDevice(0),
                SimOp::RecordEvent { device: 0 },
                launch(0, 0),
                SimOp::RecordEvent { device: 0 },
                SimOp::SetDevice(1),
                SimOp::RecordEvent { device: 1 },
                launch(1, 32),
                SimOp::RecordEvent { device: 1 },
                SimOp::SyncEvent { device: 0 },
                SimOp::SyncEvent { device: 1 },
            ]
        );
    }

    #[test]
    fn test_coherent_arguments_wrap_the_launches() {
        let registry = DeviceRegistry::new(SimRuntime::new(2));
        let journal = Arc::new(Journal::default());
        let kernel = journaling_kernel(&journal);
        let base = 0u64;

        let done = launch(
            &registry,
            &kernel,
            "journal",
            GridConfig::new([10], Dim3::default()),
            ComputeConf::new([true], 2),
        )
        .call(KernelArgs::new().coherent_arg(&base, journal.clone(), false));

        assert!(done);
        assert_eq!(
            journal.entries(),
            vec![
                "release [0, 1] false",
                "current 0",
                "launch 0 0 10",
                "current 1",
                "launch 1 5 10",
                "acquire",
            ]
        );
    }

    #[test]
    fn test_empty_slots_are_skipped() {
        let registry = DeviceRegistry::new(SimRuntime::new(4));
        let journal = Arc::new(Journal::default());
        let kernel = SimKernel::noop("noop");
        let base = 0u64;

        let launcher = launch(
            &registry,
            &kernel,
            "noop",
            GridConfig::new([5], Dim3::default()),
            ComputeConf::new([true], 4),
        );
        registry.runtime().clear_trace();
        launcher.call(KernelArgs::new().coherent_arg(&base, journal.clone(), true));

        let trace = registry.runtime().trace();
        let grids: Vec<_> = launches(&trace)
            .into_iter()
            .map(|(device, grid, _)| (device, grid.x))
            .collect();
        assert_eq!(grids, vec![(0, 2), (1, 2), (2, 1)]);

        let waited: Vec<_> = trace
            .iter()
            .filter_map(|op| match op {
                SimOp::SyncEvent { device } => Some(*device),
                _ => None,
            })
            .collect();
        assert_eq!(waited, vec![0, 1, 2]);
        assert_eq!(journal.entries()[0], "release [0, 1, 2] true");
    }

    #[test]
    fn test_transpose_xy_swaps_local_grid() {
        let registry = DeviceRegistry::new(SimRuntime::new(2));
        let kernel = SimKernel::noop("noop");

        launch(
            &registry,
            &kernel,
            "noop",
            GridConfig::new([4, 6], Dim3::default()),
            ComputeConf::new([false, true], 2),
        )
        .transpose_xy()
        .call(KernelArgs::new());

        let grids: Vec<_> = launches(&registry.runtime().trace())
            .into_iter()
            .map(|(_, grid, offset)| (grid, offset))
            .collect();
        assert_eq!(
            grids,
            vec![
                (Dim3::new(4, 3, 1), Dim3::new(0, 0, 0)),
                (Dim3::new(4, 3, 1), Dim3::new(3, 0, 0)),
            ]
        );
    }

    #[test]
    fn test_unpartitioned_launch_uses_first_device() {
        let registry = DeviceRegistry::new(SimRuntime::new(2));
        let kernel = SimKernel::noop("noop");

        let launcher = launch(
            &registry,
            &kernel,
            "noop",
            GridConfig::new([3, 8, 8], Dim3::default()).with_shared_mem(256),
            ComputeConf::none(),
        );
        registry.runtime().clear_trace();
        launcher.call(KernelArgs::new());

        assert_eq!(
            launches(&registry.runtime().trace()),
            vec![(0, Dim3::new(8, 8, 3), Dim3::new(0, 0, 0))]
        );
    }

    #[test]
    fn test_async_launch_acquires_on_completion() {
        let registry = DeviceRegistry::new(SimRuntime::new(2));
        let journal = Arc::new(Journal::default());
        let kernel = journaling_kernel(&journal);
        let base = 0u64;

        let handle = launch_async(
            &registry,
            &kernel,
            "journal",
            GridConfig::new([8], Dim3::default()),
            ComputeConf::new([true], 0),
        )
        .call(KernelArgs::new().coherent_arg(&base, journal.clone(), false));

        assert!(futures_lite::future::block_on(handle.into_future()));
        assert_eq!(journal.entries().last().map(String::as_str), Some("acquire"));
        assert_eq!(
            journal.entries().iter().filter(|e| e.starts_with("launch")).count(),
            2
        );
    }

    #[test]
    fn test_async_handle_blocking_wait() {
        let registry = DeviceRegistry::new(SimRuntime::new(1));
        let kernel = SimKernel::noop("noop");

        let handle = launch_async(
            &registry,
            &kernel,
            "noop",
            GridConfig::new([8], Dim3::default()),
            ComputeConf::new([true], 1),
        )
        .call(KernelArgs::new());

        assert!(handle.wait());
    }

    #[test]
    fn test_failed_completion_is_reported_before_acquire() {
        let registry = DeviceRegistry::new(SimRuntime::new(2).with_failing_syncs(1));
        let journal = Arc::new(Journal::default());
        let hook: Arc<dyn Coherent> = journal.clone();
        let coherent: Vec<CoherentArg> = vec![(hook, false)];

        let result = wait_catching(&*registry, &[0, 1], &coherent);

        let message = result.expect_err("device 1 cannot be waited on");
        assert!(message.starts_with("cannot wait for device"), "{message}");
        assert!(message.contains("event sync failed on device 1"), "{message}");
        assert!(journal.entries().is_empty());
    }

    #[test]
    fn test_completion_passes_through_when_every_device_finishes() {
        let registry = DeviceRegistry::new(SimRuntime::new(2));
        let journal = Arc::new(Journal::default());
        let hook: Arc<dyn Coherent> = journal.clone();
        let coherent: Vec<CoherentArg> = vec![(hook, true)];

        assert_eq!(wait_catching(&*registry, &[0, 1], &coherent), Ok(true));
        assert_eq!(journal.entries(), vec!["acquire"]);
    }

    #[test]
    #[should_panic = "cannot launch faulty: kernel launch failed: faulty rejected on device 1"]
    fn test_failed_launch_is_fatal() {
        let registry = DeviceRegistry::new(SimRuntime::new(2).with_failing_launches(1));
        let kernel = SimKernel::noop("faulty");

        launch(
            &registry,
            &kernel,
            "faulty",
            GridConfig::new([8], Dim3::default()),
            ComputeConf::new([true], 2),
        )
        .call(KernelArgs::new());
    }
}
