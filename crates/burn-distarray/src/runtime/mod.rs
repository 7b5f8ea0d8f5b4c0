//! Native device primitives and the per-device resources built on top of them.

mod registry;
pub mod sim;

pub use registry::*;

use core::ffi::c_void;
use core::fmt;

use derive_new::new;

use crate::error::RuntimeError;

/// Index of a physical device.
pub type DeviceId = usize;

/// Address in the unified virtual address space shared by all devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Raw address.
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one.
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Three-dimensional launch extent, `x` being the fastest-varying axis.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dim3 {
    /// Lowest-order extent.
    pub x: usize,
    /// Middle extent.
    pub y: usize,
    /// Highest-order extent.
    pub z: usize,
}

impl Dim3 {
    /// Packs up to three compute axes, highest-order first, into `z`, `y`, `x`.
    ///
    /// Missing higher-order axes are filled with `fill`.
    pub fn from_axes<const DC: usize>(axes: &[usize; DC], fill: usize) -> Self {
        const { assert!(DC >= 1 && DC <= 3, "launch grids have one to three dims") };

        let at = |back: usize| {
            if back <= DC {
                axes[DC - back]
            } else {
                fill
            }
        };
        Self::new(at(1), at(2), at(3))
    }

    /// Number of points in the extent.
    pub fn volume(&self) -> usize {
        self.x * self.y * self.z
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

/// Geometry of one kernel launch on one device.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Blocks launched on this device.
    pub grid: Dim3,
    /// Threads per block.
    pub block: Dim3,
    /// Dynamic shared memory per block, in bytes.
    pub shared_mem: usize,
    /// Blocks of the whole computation across all devices.
    pub global_grid: Dim3,
    /// Position of this device's first block in the global grid.
    pub offset: Dim3,
}

/// Low-level primitives of an accelerator runtime.
///
/// All devices share one virtual address space: an address returned by
/// [`malloc`](DeviceRuntime::malloc) on one device can be dereferenced by kernels
/// running on any other. The "current device" is runtime state selected with
/// [`set_device`](DeviceRuntime::set_device); allocations, streams and events
/// belong to the device that was current when they were created.
pub trait DeviceRuntime: Send + Sync + 'static {
    /// Queue of work executing in order on one device.
    type Stream: Clone + Send + Sync + 'static;
    /// Marker recorded into a stream that can be waited on.
    type Event: Clone + Send + Sync + 'static;
    /// Handle to device code that can be launched.
    type Kernel: Send + Sync;

    /// Number of installed devices.
    fn device_count(&self) -> usize;

    /// Makes `device` the current device.
    fn set_device(&self, device: DeviceId) -> Result<(), RuntimeError>;

    /// Allocates `bytes` on the current device.
    fn malloc(&self, bytes: usize) -> Result<DevicePtr, RuntimeError>;

    /// Releases an allocation returned by [`malloc`](DeviceRuntime::malloc).
    fn free(&self, ptr: DevicePtr) -> Result<(), RuntimeError>;

    /// Copies host bytes to device memory.
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), RuntimeError>;

    /// Copies device memory to host bytes.
    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), RuntimeError>;

    /// Creates a stream on the current device.
    fn create_stream(&self) -> Result<Self::Stream, RuntimeError>;

    /// Creates an event on the current device.
    fn create_event(&self) -> Result<Self::Event, RuntimeError>;

    /// Records `event` once all work queued so far on `stream` completes.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> Result<(), RuntimeError>;

    /// Blocks until `event` has completed.
    fn synchronize_event(&self, event: &Self::Event) -> Result<(), RuntimeError>;

    /// Blocks until all work on the current device has completed.
    fn synchronize_device(&self) -> Result<(), RuntimeError>;

    /// Queues `kernel` on `stream`.
    ///
    /// `params` holds the address of every kernel argument, in order.
    fn launch_kernel(
        &self,
        kernel: &Self::Kernel,
        config: &LaunchConfig,
        params: &[*const c_void],
        stream: &Self::Stream,
    ) -> Result<(), RuntimeError>;
}
