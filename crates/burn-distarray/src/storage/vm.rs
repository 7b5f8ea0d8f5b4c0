use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bytemuck::Pod;

use super::DistributedStorage;
use super::page::PageAllocator;
use crate::error::{OrFatal, fatal};
use crate::layout::{Align, ArrayLayout};
use crate::runtime::{DevicePtr, DeviceRegistry, DeviceRuntime};
use crate::sharding::{ComputeMapping, Distribution, resolve_procs};

/// Device allocation chain of a distributed array.
#[derive(Debug)]
struct Placement<const D: usize> {
    distribution: Distribution<D>,
    granules: Vec<DevicePtr>,
    base: DevicePtr,
    pages_per_device: Vec<usize>,
    imbalance_ratio: f64,
}

/// Array spread over several devices through one flat virtual address range.
///
/// The aligned buffer is cut into granules. Each granule is allocated on the
/// device owning most of its elements, and all granules must land at
/// consecutive addresses, so a kernel running on any device can address the
/// whole array from a single base pointer while most of its accesses stay
/// local.
pub struct VmStorage<T: Pod, const D: usize, R: DeviceRuntime> {
    registry: Arc<DeviceRegistry<R>>,
    layout: ArrayLayout<D>,
    host: Vec<T>,
    placement: Option<Placement<D>>,
}

impl<T: Pod, const D: usize, R: DeviceRuntime> VmStorage<T, D, R> {
    /// Creates a zeroed array that lives on the host until it is distributed.
    pub fn new(registry: &Arc<DeviceRegistry<R>>, extents: [usize; D], align: Align) -> Self {
        let layout = ArrayLayout::new(extents, align);
        Self {
            registry: registry.clone(),
            layout,
            host: vec![T::zeroed(); layout.elems_aligned()],
            placement: None,
        }
    }

    /// Shape and padding of the array.
    pub fn layout(&self) -> &ArrayLayout<D> {
        &self.layout
    }

    /// The padded host buffer.
    pub fn host(&self) -> &[T] {
        &self.host
    }

    /// The padded host buffer.
    pub fn host_mut(&mut self) -> &mut [T] {
        &mut self.host
    }

    /// Tile placement, once distributed.
    pub fn distribution(&self) -> Option<&Distribution<D>> {
        self.placement.as_ref().map(|placement| &placement.distribution)
    }

    /// Device address of logical element `0`.
    pub fn device_base(&self) -> DevicePtr {
        self.placement().base
    }

    /// Device address of the element at `(i, j, k)`, see [`access_pos`](DistributedStorage::access_pos).
    pub fn device_addr(&self, i: usize, j: usize, k: usize) -> DevicePtr {
        let pos = self.layout.linearize(index3(i, j, k));
        self.device_base().offset(pos * size_of::<T>())
    }

    /// Fraction of the elements stored in a granule owned by another device.
    pub fn imbalance_ratio(&self) -> f64 {
        self.placement().imbalance_ratio
    }

    /// Number of granules allocated on each device.
    pub fn pages_per_device(&self) -> &[usize] {
        &self.placement().pages_per_device
    }

    /// Element at a full logical index, in the host buffer.
    pub fn access(&self, index: [usize; D]) -> &T {
        &self.host[self.layout.offset() + self.layout.linearize(index)]
    }

    /// Element at a full logical index, in the host buffer.
    pub fn access_mut(&mut self, index: [usize; D]) -> &mut T {
        let pos = self.layout.offset() + self.layout.linearize(index);
        &mut self.host[pos]
    }

    fn placement(&self) -> &Placement<D> {
        match &self.placement {
            Some(placement) => placement,
            None => fatal!("array of {:?} elements is not distributed", self.layout.extents()),
        }
    }

    fn granule_bytes(&self) -> usize {
        self.registry.config().granule_bytes
    }

    /// Allocates the granules of the aligned buffer, one per page of the allocator.
    fn alloc(&self, distribution: Distribution<D>) -> Placement<D> {
        let granule_bytes = self.granule_bytes();
        let elem_bytes = size_of::<T>();
        if elem_bytes == 0 || granule_bytes % elem_bytes != 0 {
            fatal!("granule of {granule_bytes} bytes does not hold whole elements of {elem_bytes} bytes");
        }

        let mut allocator = PageAllocator::new(
            distribution.devices,
            *self.layout.extents(),
            *self.layout.aligned(),
            distribution.local_tile,
            distribution.dim_to_device,
            granule_bytes / elem_bytes,
        );

        let runtime = self.registry.runtime();
        let mut granules: Vec<DevicePtr> = Vec::new();
        let mut pages_per_device = vec![0; distribution.devices];

        loop {
            let (done, page) = allocator.advance();
            if page.total() > 0 {
                runtime
                    .set_device(page.device)
                    .or_fatal("cannot select device");
                let ptr = runtime
                    .malloc(granule_bytes)
                    .or_fatal("cannot allocate granule");
                log::debug!(
                    "VM> ALLOCATE: {ptr} in {} (final: {done} total: {})",
                    page.device,
                    page.total()
                );

                if let Some(last) = granules.last() {
                    let expected = last.offset(granule_bytes);
                    if ptr != expected {
                        fatal!("VM> non-contiguous allocation: expected {expected}, got {ptr}");
                    }
                }
                granules.push(ptr);
                pages_per_device[page.device] += 1;
            }
            if done {
                break;
            }
        }

        let base = match granules.first() {
            Some(first) => first.offset(self.layout.offset() * elem_bytes),
            None => DevicePtr(0),
        };
        let imbalance_ratio = allocator.imbalance_ratio();
        log::info!(
            "VM> allocated {} granules of {granule_bytes} bytes, per device: {pages_per_device:?}, imbalance: {imbalance_ratio:.3}",
            granules.len()
        );

        Placement {
            distribution,
            granules,
            base,
            pages_per_device,
            imbalance_ratio,
        }
    }

    /// Start of the device range, padding included.
    fn device_start(&self) -> DevicePtr {
        let placement = self.placement();
        placement.granules.first().copied().unwrap_or(placement.base)
    }
}

/// Full index for the first `D` of up to three coordinates, `i` being the highest-order one.
fn index3<const D: usize>(i: usize, j: usize, k: usize) -> [usize; D] {
    const { assert!(D >= 1 && D <= 3, "positional access supports one to three dims") };
    let coords = [i, j, k];
    core::array::from_fn(|dim| coords[dim])
}

impl<T: Pod, const D: usize, R: DeviceRuntime> DistributedStorage<T, D> for VmStorage<T, D, R> {
    fn distribute<const DC: usize>(&mut self, mapping: &ComputeMapping<DC, D>) -> bool {
        if self.placement.is_some() {
            log::debug!("VM> array is already distributed");
            return false;
        }

        let procs = resolve_procs(mapping.procs(), self.registry.device_count());
        let mapping = ComputeMapping::new(mapping.comp.with_procs(procs), mapping.dims);

        let distribution = if procs == 1 {
            Distribution::single(self.layout.extents())
        } else {
            Distribution::compute(&mapping, self.layout.extents())
                .or_fatal("cannot distribute array")
        };

        self.placement = Some(self.alloc(distribution));
        true
    }

    fn is_distributed(&self) -> bool {
        self.placement.is_some()
    }

    fn to_device(&self) {
        let granule_bytes = self.granule_bytes();
        let start = self.device_start();
        let runtime = self.registry.runtime();

        let bytes: &[u8] = bytemuck::cast_slice(self.host.as_slice());
        for (idx, chunk) in bytes.chunks(granule_bytes).enumerate() {
            let dst = start.offset(idx * granule_bytes);
            log::debug!("VM> COPYING TO DEVICE: chunk {idx} -> {dst} ({} bytes)", chunk.len());
            runtime
                .copy_to_device(dst, chunk)
                .or_fatal("cannot copy to device");
        }
    }

    fn to_host(&mut self) {
        let granule_bytes = self.granule_bytes();
        let start = self.device_start();
        let registry = self.registry.clone();

        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.host.as_mut_slice());
        for (idx, chunk) in bytes.chunks_mut(granule_bytes).enumerate() {
            let src = start.offset(idx * granule_bytes);
            log::debug!("VM> COPYING TO HOST: {src} -> chunk {idx} ({} bytes)", chunk.len());
            registry
                .runtime()
                .copy_to_host(chunk, src)
                .or_fatal("cannot copy to host");
        }
    }

    fn access_pos(&self, i: usize, j: usize, k: usize) -> &T {
        self.access(index3(i, j, k))
    }

    fn access_pos_mut(&mut self, i: usize, j: usize, k: usize) -> &mut T {
        self.access_mut(index3(i, j, k))
    }
}

impl<T: Pod, const D: usize, R: DeviceRuntime> Drop for VmStorage<T, D, R> {
    fn drop(&mut self) {
        let Some(placement) = self.placement.take() else {
            return;
        };
        let runtime = self.registry.runtime();
        for ptr in placement.granules {
            if let Err(err) = runtime.free(ptr) {
                log::error!("VM> cannot free granule {ptr}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DistConfig;
    use crate::runtime::sim::{SimOp, SimRuntime};
    use crate::sharding::ComputeConf;

    fn registry(devices: usize, granule_bytes: usize) -> Arc<DeviceRegistry<SimRuntime>> {
        let config = DistConfig::default().with_granule_bytes(granule_bytes);
        DeviceRegistry::with_config(SimRuntime::new(devices), config)
    }

    fn mallocs(registry: &DeviceRegistry<SimRuntime>) -> Vec<(usize, DevicePtr)> {
        registry
            .runtime()
            .trace()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::Malloc { device, ptr, .. } => Some((device, ptr)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_two_devices_get_one_contiguous_granule_each() {
        let registry = DeviceRegistry::new(SimRuntime::new(2));
        let mut storage = VmStorage::<f32, 2, _>::new(&registry, [1024, 1024], Align::default());
        let mapping = ComputeMapping::identity(ComputeConf::new([true, false], 2));

        assert!(storage.distribute(&mapping));

        let distribution = storage.distribution().unwrap();
        assert_eq!(distribution.local_tile, [512, 1024]);
        assert_eq!(distribution.dim_to_device, [1, 0]);

        let allocations = mallocs(&registry);
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].0, 0);
        assert_eq!(allocations[1].0, 1);
        assert_eq!(allocations[1].1, allocations[0].1.offset(2 << 20));
        assert_eq!(storage.device_base(), allocations[0].1);
        assert_eq!(storage.pages_per_device(), &[1, 1]);
        assert_eq!(storage.imbalance_ratio(), 0.0);
    }

    #[test]
    fn test_second_distribute_is_a_noop() {
        let registry = registry(2, 64);
        let mut storage = VmStorage::<u32, 2, _>::new(&registry, [8, 8], Align::default());
        let mapping = ComputeMapping::identity(ComputeConf::new([true, false], 2));

        assert!(storage.distribute(&mapping));
        let distribution = *storage.distribution().unwrap();
        let base = storage.device_base();
        let allocations = mallocs(&registry).len();

        let other = ComputeMapping::identity(ComputeConf::new([false, true], 2));
        assert!(!storage.distribute(&other));
        assert!(storage.is_distributed());
        assert_eq!(storage.distribution(), Some(&distribution));
        assert_eq!(storage.device_base(), base);
        assert_eq!(mallocs(&registry).len(), allocations);
    }

    #[test]
    fn test_round_trip_with_partial_last_granule() {
        let registry = registry(2, 64);
        let mut storage = VmStorage::<f32, 2, _>::new(&registry, [5, 7], Align::default());
        storage.distribute(&ComputeMapping::identity(ComputeConf::new([true, false], 2)));

        for (idx, value) in storage.host_mut().iter_mut().enumerate() {
            *value = idx as f32 * 0.5;
        }
        let expected = storage.host().to_vec();

        storage.to_device();
        storage.host_mut().fill(0.0);
        storage.to_host();

        assert_eq!(storage.host(), expected.as_slice());

        let copied: Vec<_> = registry
            .runtime()
            .trace()
            .into_iter()
            .filter_map(|op| match op {
                SimOp::CopyToDevice { bytes, .. } => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(copied, vec![64, 64, 12]);
    }

    #[test]
    fn test_single_device_keeps_full_extents() {
        let registry = registry(4, 64);
        let mut storage = VmStorage::<u32, 2, _>::new(&registry, [6, 10], Align::default());
        let mapping = ComputeMapping::identity(ComputeConf::new([true, true], 1));

        assert!(storage.distribute(&mapping));

        let distribution = storage.distribution().unwrap();
        assert_eq!(distribution.local_tile, [6, 10]);
        assert_eq!(distribution.dim_to_device, [0, 0]);
        assert_eq!(distribution.owner(&[5, 9]), 0);
        assert!(mallocs(&registry).iter().all(|(device, _)| *device == 0));
        assert_eq!(storage.pages_per_device(), &[4]);
    }

    #[test]
    fn test_zero_procs_uses_every_device() {
        let registry = registry(4, 64);
        let mut storage = VmStorage::<u32, 1, _>::new(&registry, [64], Align::default());

        storage.distribute(&ComputeMapping::identity(ComputeConf::new([true], 0)));

        assert_eq!(storage.distribution().unwrap().devices, 4);
        assert_eq!(storage.pages_per_device(), &[1, 1, 1, 1]);
    }

    #[test]
    fn test_padding_shifts_base_pointer() {
        let registry = registry(1, 64);
        let mut storage =
            VmStorage::<f32, 2, _>::new(&registry, [2, 10], Align::with_position(8, 3));
        storage.distribute(&ComputeMapping::<1, 2>::new(
            ComputeConf::none(),
            [crate::sharding::DimDistribution::Replicated; 2],
        ));

        *storage.access_pos_mut(1, 4, 0) = 3.5;
        assert_eq!(storage.host()[5 + 16 + 4], 3.5);
        assert_eq!(*storage.access([1, 4]), 3.5);

        let start = mallocs(&registry)[0].1;
        assert_eq!(storage.device_base(), start.offset(5 * 4));
        assert_eq!(storage.device_addr(1, 4, 0), start.offset((5 + 16 + 4) * 4));

        storage.to_device();
        let value = registry.runtime().read::<f32>(storage.device_addr(1, 4, 0));
        assert_eq!(value, Ok(3.5));
    }

    #[test]
    fn test_drop_frees_every_granule() {
        let registry = registry(2, 64);
        let mut storage = VmStorage::<u32, 2, _>::new(&registry, [8, 8], Align::default());
        storage.distribute(&ComputeMapping::identity(ComputeConf::new([true, false], 2)));
        assert_eq!(registry.runtime().live_allocations(), 4);

        drop(storage);

        assert_eq!(registry.runtime().live_allocations(), 0);
    }

    #[test]
    #[should_panic = "non-contiguous allocation"]
    fn test_fragmented_address_space_is_fatal() {
        let config = DistConfig::default().with_granule_bytes(64);
        let registry =
            DeviceRegistry::with_config(SimRuntime::new(2).with_fragmentation(4096), config);
        let mut storage = VmStorage::<u32, 2, _>::new(&registry, [8, 8], Align::default());

        storage.distribute(&ComputeMapping::identity(ComputeConf::new([true, false], 2)));
    }

    #[test]
    #[should_panic = "not enough partitioned compute dims: 1, to partition 2 array dims"]
    fn test_insufficient_partition_axes_is_fatal() {
        let registry = registry(2, 64);
        let mut storage = VmStorage::<u32, 2, _>::new(&registry, [8, 8], Align::default());
        let mapping = ComputeMapping::new(
            ComputeConf::new([true, false], 2),
            [crate::sharding::DimDistribution::Sharded(0); 2],
        );

        storage.distribute(&mapping);
    }

    #[test]
    #[should_panic = "is not distributed"]
    fn test_copy_before_distribute_is_fatal() {
        let registry = registry(1, 64);
        let storage = VmStorage::<u32, 1, _>::new(&registry, [16], Align::default());

        storage.to_device();
    }

    #[test]
    #[should_panic = "does not hold whole elements"]
    fn test_granule_must_hold_whole_elements() {
        let registry = registry(1, 64);
        let mut storage = VmStorage::<[u8; 3], 1, _>::new(&registry, [16], Align::default());

        storage.distribute(&ComputeMapping::identity(ComputeConf::new([true], 1)));
    }
}
