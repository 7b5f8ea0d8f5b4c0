//! Host-simulated multi-device runtime.
//!
//! [`SimRuntime`] models a set of devices sharing one flat virtual address
//! space. Allocations are handed out by a bump allocator, so consecutive
//! allocations are contiguous unless fragmentation is requested. Kernels are
//! host closures that run synchronously when launched, so every stream is
//! complete as soon as work is queued on it. Every primitive call is appended
//! to a trace that tests can inspect.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ffi::c_void;

use bytemuck::Pod;
use hashbrown::HashMap;
use spin::Mutex;

use super::{DeviceId, DevicePtr, DeviceRuntime, Dim3, LaunchConfig};
use crate::error::RuntimeError;

/// First address handed out by the simulated allocator.
pub const SIM_BASE_ADDR: u64 = 0x2000_0000_0000;

/// Stream owned by one simulated device.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimStream {
    id: usize,
    device: DeviceId,
}

impl SimStream {
    /// Device the stream was created on.
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

/// Event owned by one simulated device.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimEvent {
    id: usize,
    device: DeviceId,
}

impl SimEvent {
    /// Device the event was created on.
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

/// One primitive call observed by [`SimRuntime`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimOp {
    /// Current device changed.
    SetDevice(DeviceId),
    /// Memory allocated on a device.
    Malloc {
        /// Owning device.
        device: DeviceId,
        /// Returned address.
        ptr: DevicePtr,
        /// Allocation size.
        bytes: usize,
    },
    /// Memory released.
    Free(DevicePtr),
    /// Host to device copy.
    CopyToDevice {
        /// Destination address.
        dst: DevicePtr,
        /// Copy size.
        bytes: usize,
    },
    /// Device to host copy.
    CopyToHost {
        /// Source address.
        src: DevicePtr,
        /// Copy size.
        bytes: usize,
    },
    /// Stream created.
    CreateStream {
        /// Owning device.
        device: DeviceId,
    },
    /// Event created.
    CreateEvent {
        /// Owning device.
        device: DeviceId,
    },
    /// Event recorded into a stream.
    RecordEvent {
        /// Device owning the event.
        device: DeviceId,
    },
    /// Host waited on an event.
    SyncEvent {
        /// Device owning the event.
        device: DeviceId,
    },
    /// Host waited for a whole device.
    SyncDevice(DeviceId),
    /// Kernel launched.
    Launch {
        /// Device the kernel runs on.
        device: DeviceId,
        /// Kernel name.
        kernel: String,
        /// Local grid.
        grid: Dim3,
        /// Offset of the local grid in the global grid.
        offset: Dim3,
        /// Number of kernel parameters.
        params: usize,
    },
}

/// Everything a simulated kernel sees about its launch.
pub struct SimLaunch<'a> {
    /// Device the kernel runs on.
    pub device: DeviceId,
    /// Launch geometry.
    pub config: &'a LaunchConfig,
    /// Address of every kernel argument.
    pub params: &'a [*const c_void],
}

type SimKernelFn = dyn Fn(&SimRuntime, &SimLaunch<'_>) + Send + Sync;

/// Device code for [`SimRuntime`]: a host closure run once per launch.
#[derive(Clone)]
pub struct SimKernel {
    name: String,
    body: Arc<SimKernelFn>,
}

impl SimKernel {
    /// Wraps a closure as a kernel.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&SimRuntime, &SimLaunch<'_>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    /// A kernel that does nothing.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::new(name, |_, _| {})
    }

    /// Kernel name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct SimAllocation {
    device: DeviceId,
    data: Vec<u8>,
}

struct SimState {
    current: DeviceId,
    next_addr: u64,
    allocations: BTreeMap<u64, SimAllocation>,
    records: HashMap<usize, usize>,
    next_id: usize,
    trace: Vec<SimOp>,
}

impl SimState {
    fn allocation_mut(&mut self, addr: u64, len: usize) -> Result<(&mut [u8], usize), RuntimeError> {
        let (base, allocation) = self
            .allocations
            .range_mut(..=addr)
            .next_back()
            .ok_or(RuntimeError::InvalidAddress(DevicePtr(addr)))?;
        let start = (addr - *base) as usize;
        if start >= allocation.data.len() {
            return Err(RuntimeError::InvalidAddress(DevicePtr(addr)));
        }
        if start + len > allocation.data.len() {
            return Err(RuntimeError::CopyOutOfBounds {
                addr: DevicePtr(addr),
                len,
            });
        }
        Ok((&mut allocation.data[start..start + len], allocation.device))
    }

    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }
}

/// Simulated devices sharing one virtual address space.
pub struct SimRuntime {
    devices: usize,
    gap_bytes: u64,
    failing_launches: Option<DeviceId>,
    failing_syncs: Option<DeviceId>,
    state: Mutex<SimState>,
}

impl SimRuntime {
    /// Simulates `devices` devices.
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            gap_bytes: 0,
            failing_launches: None,
            failing_syncs: None,
            state: Mutex::new(SimState {
                current: 0,
                next_addr: SIM_BASE_ADDR,
                allocations: BTreeMap::new(),
                records: HashMap::new(),
                next_id: 0,
                trace: Vec::new(),
            }),
        }
    }

    /// Leaves `gap_bytes` of unmapped address space after every allocation.
    pub fn with_fragmentation(mut self, gap_bytes: u64) -> Self {
        self.gap_bytes = gap_bytes;
        self
    }

    /// Makes every kernel launch on `device` fail.
    pub fn with_failing_launches(mut self, device: DeviceId) -> Self {
        self.failing_launches = Some(device);
        self
    }

    /// Makes every wait on an event of `device` fail.
    pub fn with_failing_syncs(mut self, device: DeviceId) -> Self {
        self.failing_syncs = Some(device);
        self
    }

    /// Copy of every primitive call made so far.
    pub fn trace(&self) -> Vec<SimOp> {
        self.state.lock().trace.clone()
    }

    /// Forgets the calls recorded so far.
    pub fn clear_trace(&self) {
        self.state.lock().trace.clear();
    }

    /// The current device.
    pub fn current_device(&self) -> DeviceId {
        self.state.lock().current
    }

    /// Number of live allocations owned by `device`.
    pub fn allocations_on(&self, device: DeviceId) -> usize {
        self.state
            .lock()
            .allocations
            .values()
            .filter(|allocation| allocation.device == device)
            .count()
    }

    /// Number of live allocations on all devices.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Device owning the allocation that contains `ptr`.
    pub fn owner_of(&self, ptr: DevicePtr) -> Result<DeviceId, RuntimeError> {
        let mut state = self.state.lock();
        state.allocation_mut(ptr.addr(), 0).map(|(_, device)| device)
    }

    /// Number of times `event` has been recorded.
    pub fn record_count(&self, event: &SimEvent) -> usize {
        self.state
            .lock()
            .records
            .get(&event.id)
            .copied()
            .unwrap_or(0)
    }

    /// Reads one value from device memory.
    pub fn read<T: Pod>(&self, ptr: DevicePtr) -> Result<T, RuntimeError> {
        let mut state = self.state.lock();
        let (bytes, _) = state.allocation_mut(ptr.addr(), size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Writes one value to device memory.
    pub fn write<T: Pod>(&self, ptr: DevicePtr, value: T) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let (bytes, _) = state.allocation_mut(ptr.addr(), size_of::<T>())?;
        bytes.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}

impl DeviceRuntime for SimRuntime {
    type Stream = SimStream;
    type Event = SimEvent;
    type Kernel = SimKernel;

    fn device_count(&self) -> usize {
        self.devices
    }

    fn set_device(&self, device: DeviceId) -> Result<(), RuntimeError> {
        if device >= self.devices {
            return Err(RuntimeError::InvalidDevice {
                device,
                count: self.devices,
            });
        }
        let mut state = self.state.lock();
        state.current = device;
        state.trace.push(SimOp::SetDevice(device));
        Ok(())
    }

    fn malloc(&self, bytes: usize) -> Result<DevicePtr, RuntimeError> {
        let mut state = self.state.lock();
        let device = state.current;
        if bytes == 0 {
            return Err(RuntimeError::OutOfMemory { bytes, device });
        }

        let ptr = DevicePtr(state.next_addr);
        state.next_addr += bytes as u64 + self.gap_bytes;
        state.allocations.insert(
            ptr.addr(),
            SimAllocation {
                device,
                data: vec![0; bytes],
            },
        );
        state.trace.push(SimOp::Malloc { device, ptr, bytes });
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state
            .allocations
            .remove(&ptr.addr())
            .ok_or(RuntimeError::InvalidAddress(ptr))?;
        state.trace.push(SimOp::Free(ptr));
        Ok(())
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let (bytes, _) = state.allocation_mut(dst.addr(), src.len())?;
        bytes.copy_from_slice(src);
        state.trace.push(SimOp::CopyToDevice {
            dst,
            bytes: src.len(),
        });
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let (bytes, _) = state.allocation_mut(src.addr(), dst.len())?;
        dst.copy_from_slice(bytes);
        state.trace.push(SimOp::CopyToHost {
            src,
            bytes: dst.len(),
        });
        Ok(())
    }

    fn create_stream(&self) -> Result<SimStream, RuntimeError> {
        let mut state = self.state.lock();
        let device = state.current;
        let id = state.next_id();
        state.trace.push(SimOp::CreateStream { device });
        Ok(SimStream { id, device })
    }

    fn create_event(&self) -> Result<SimEvent, RuntimeError> {
        let mut state = self.state.lock();
        let device = state.current;
        let id = state.next_id();
        state.trace.push(SimOp::CreateEvent { device });
        Ok(SimEvent { id, device })
    }

    fn record_event(&self, event: &SimEvent, stream: &SimStream) -> Result<(), RuntimeError> {
        if event.device != stream.device {
            return Err(RuntimeError::WrongDevice {
                resource: event.device,
                current: stream.device,
            });
        }
        let mut state = self.state.lock();
        *state.records.entry(event.id).or_insert(0) += 1;
        state.trace.push(SimOp::RecordEvent {
            device: event.device,
        });
        Ok(())
    }

    fn synchronize_event(&self, event: &SimEvent) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.trace.push(SimOp::SyncEvent {
            device: event.device,
        });
        if self.failing_syncs == Some(event.device) {
            return Err(RuntimeError::Driver(format!(
                "event sync failed on device {}",
                event.device
            )));
        }
        Ok(())
    }

    fn synchronize_device(&self) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let device = state.current;
        state.trace.push(SimOp::SyncDevice(device));
        Ok(())
    }

    fn launch_kernel(
        &self,
        kernel: &SimKernel,
        config: &LaunchConfig,
        params: &[*const c_void],
        stream: &SimStream,
    ) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock();
            if stream.device != state.current {
                return Err(RuntimeError::WrongDevice {
                    resource: stream.device,
                    current: state.current,
                });
            }
            if self.failing_launches == Some(stream.device) {
                return Err(RuntimeError::Launch(format!(
                    "{} rejected on device {}",
                    kernel.name, stream.device
                )));
            }
            state.trace.push(SimOp::Launch {
                device: stream.device,
                kernel: kernel.name.clone(),
                grid: config.grid,
                offset: config.offset,
                params: params.len(),
            });
        }

        let launch = SimLaunch {
            device: stream.device,
            config,
            params,
        };
        (kernel.body)(self, &launch);
        Ok(())
    }
}
