use crate::error::DistributionError;
use crate::runtime::DeviceId;

use super::{ComputeConf, ComputeMapping, DimDistribution};

/// Prime factors of `n` in ascending order. `0` and `1` have none.
pub fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while n > 1 && p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Logical grid of devices a `DC`-dimensional computation is split over.
///
/// Devices are numbered in row-major order over the grid: the lowest-order
/// compute axis varies fastest. The same numbering is used to place array
/// tiles and to pick the device each dispatch slot runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceMesh<const DC: usize> {
    /// Devices along each compute axis.
    shape: [usize; DC],
    /// Device-id contribution of one step along each compute axis.
    strides: [usize; DC],
}

impl<const DC: usize> DeviceMesh<DC> {
    /// Splits `comp.procs` devices over the partitioned axes of `comp`.
    ///
    /// The device count is factorized into primes sorted in descending
    /// order. The first partitioned axis takes the largest leading factors so
    /// that later axes each get one factor, which keeps tiles close to
    /// isotropic. Axes that are not partitioned always get a single device.
    pub fn for_compute(comp: &ComputeConf<DC>) -> Self {
        let mut factors = prime_factors(comp.procs);
        if factors.is_empty() {
            factors.push(1);
        }
        factors.sort_unstable_by(|a, b| b.cmp(a));

        let part_dims = comp.part_dims();
        let mut shape = [1; DC];
        let mut next = 0;
        for (axis, partitioned) in comp.partitioned.iter().enumerate() {
            if !partitioned {
                continue;
            }
            let take = if next == 0 {
                (factors.len() + 1).saturating_sub(part_dims).max(1)
            } else {
                1
            };
            shape[axis] = factors.iter().skip(next).take(take).product();
            next += take;
        }

        Self::new(shape)
    }

    /// Builds a mesh with an explicit shape.
    pub fn new(shape: [usize; DC]) -> Self {
        let mut strides = [1; DC];
        for axis in (0..DC.saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * shape[axis + 1];
        }
        Self { shape, strides }
    }

    /// Devices along each compute axis.
    pub fn shape(&self) -> &[usize; DC] {
        &self.shape
    }

    /// Device-id offsets of each compute axis.
    pub fn strides(&self) -> &[usize; DC] {
        &self.strides
    }

    /// Number of slots in the mesh.
    pub fn num_devices(&self) -> usize {
        self.shape.iter().product()
    }

    /// Device at the given grid coordinates.
    pub fn device_at(&self, coords: &[usize; DC]) -> DeviceId {
        coords
            .iter()
            .zip(self.strides.iter())
            .map(|(coord, stride)| coord * stride)
            .sum()
    }

    /// Grid coordinates of every slot, highest-order axis outermost.
    pub fn coords(&self) -> impl Iterator<Item = [usize; DC]> + '_ {
        (0..self.num_devices()).map(move |device| {
            let mut coords = [0; DC];
            for (axis, coord) in coords.iter_mut().enumerate() {
                *coord = (device / self.strides[axis]) % self.shape[axis];
            }
            coords
        })
    }
}

/// Per-device placement of a `D`-dimensional array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Distribution<const D: usize> {
    /// Devices the array is spread over.
    pub devices: usize,
    /// Number of tiles along each array axis.
    pub array_grid: [usize; D],
    /// Extents of the tile each device owns.
    pub local_tile: [usize; D],
    /// Device-id contribution of one tile step along each array axis.
    pub dim_to_device: [usize; D],
}

impl<const D: usize> Distribution<D> {
    /// Places the whole array on device `0`.
    pub fn single(extents: &[usize; D]) -> Self {
        Self {
            devices: 1,
            array_grid: [1; D],
            local_tile: extents.map(|extent| extent.max(1)),
            dim_to_device: [0; D],
        }
    }

    /// Tiles an array with the given extents to match `mapping`.
    pub fn compute<const DC: usize>(
        mapping: &ComputeMapping<DC, D>,
        extents: &[usize; D],
    ) -> Result<Self, DistributionError> {
        let array_parts = mapping.array_part_dims();
        let comp_parts = mapping.comp.part_dims();
        if array_parts > comp_parts {
            return Err(DistributionError::InsufficientPartitionAxes {
                compute: comp_parts,
                array: array_parts,
            });
        }
        for (dim, dist) in mapping.dims.iter().enumerate() {
            if let DimDistribution::Sharded(axis) = dist {
                if *axis >= DC {
                    return Err(DistributionError::UnknownComputeAxis {
                        dim,
                        axis: *axis,
                        dims: DC,
                    });
                }
            }
        }

        let mesh = DeviceMesh::for_compute(&mapping.comp);
        let array_to_comp = mapping.array_to_comp();

        let array_grid = array_to_comp.map(|axis| axis.map_or(1, |axis| mesh.shape()[axis]));

        let mut local_tile = [1; D];
        let mut dim_to_device = [0; D];
        for dim in 0..D {
            local_tile[dim] = extents[dim].div_ceil(array_grid[dim]).max(1);
            if let Some(axis) = array_to_comp[dim] {
                if mesh.shape()[axis] > 1 {
                    dim_to_device[dim] = mesh.strides()[axis];
                }
            }
        }

        log::debug!("VM> PARTITIONING");
        log::debug!("VM> - array dims: {extents:?}");
        log::debug!("VM> - comp -> array: {array_to_comp:?}");
        log::debug!(
            "VM> - gpus: {}, comp part: {:?} ({comp_parts})",
            mapping.comp.procs,
            mapping.comp.partitioned
        );
        log::debug!("VM> - comp grid: {:?}", mesh.shape());
        log::debug!("VM> - array grid: {array_grid:?}");
        log::debug!("VM> - local dims: {local_tile:?}");
        log::debug!("VM> - array grid offsets: {dim_to_device:?}");

        Ok(Self {
            devices: mapping.comp.procs,
            array_grid,
            local_tile,
            dim_to_device,
        })
    }

    /// Device owning the element at `index`.
    pub fn owner(&self, index: &[usize; D]) -> DeviceId {
        index
            .iter()
            .zip(self.local_tile.iter())
            .zip(self.dim_to_device.iter())
            .map(|((idx, tile), stride)| (idx / tile) * stride)
            .sum()
    }
}
