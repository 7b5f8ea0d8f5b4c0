use alloc::vec::Vec;

use crate::runtime::DeviceId;
use crate::sharding::DeviceMesh;

/// Part of the compute grid assigned to one slot of the device mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot<const DC: usize> {
    /// Device running the slot.
    pub device: DeviceId,
    /// Position of the slot in the device mesh.
    pub coords: [usize; DC],
    /// First block of the slot in the global grid.
    pub offset: [usize; DC],
    /// Blocks of the slot along each compute axis.
    pub local: [usize; DC],
}

impl<const DC: usize> Slot<DC> {
    /// Whether the slot has no blocks to run.
    pub fn is_empty(&self) -> bool {
        self.local.contains(&0)
    }

    /// Number of blocks in the slot.
    pub fn blocks(&self) -> usize {
        self.local.iter().product()
    }
}

/// Split of a global compute grid over a device mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TilePlan<const DC: usize> {
    global: [usize; DC],
    tile: [usize; DC],
    step: [usize; DC],
    mesh: DeviceMesh<DC>,
}

impl<const DC: usize> TilePlan<DC> {
    /// Cuts `global` into one tile per mesh slot.
    ///
    /// Each axis gets tiles of `ceil(global / devices)` blocks. Axes with a
    /// single device along them are not stepped, so every slot sees them whole.
    pub fn new(global: [usize; DC], mesh: DeviceMesh<DC>) -> Self {
        let mut tile = [0; DC];
        let mut step = [0; DC];
        for axis in 0..DC {
            let parts = mesh.shape()[axis].max(1);
            tile[axis] = global[axis].div_ceil(parts);
            if parts > 1 {
                step[axis] = tile[axis];
            }
        }

        Self {
            global,
            tile,
            step,
            mesh,
        }
    }

    /// Blocks of the whole computation.
    pub fn global(&self) -> &[usize; DC] {
        &self.global
    }

    /// Unclipped tile extents.
    pub fn tile(&self) -> &[usize; DC] {
        &self.tile
    }

    /// Offset between neighbouring slots along each axis.
    pub fn step(&self) -> &[usize; DC] {
        &self.step
    }

    /// The device mesh.
    pub fn mesh(&self) -> &DeviceMesh<DC> {
        &self.mesh
    }

    /// Every slot in device order, empty ones included.
    ///
    /// A tile that runs past the end of the global grid is clipped on each
    /// axis independently. A slot starting at or beyond the end is empty.
    pub fn slots(&self) -> Vec<Slot<DC>> {
        self.mesh
            .coords()
            .map(|coords| {
                let mut offset = [0; DC];
                let mut local = [0; DC];
                for axis in 0..DC {
                    offset[axis] = coords[axis] * self.step[axis];
                    local[axis] = self.tile[axis].min(self.global[axis].saturating_sub(offset[axis]));
                }
                Slot {
                    device: self.mesh.device_at(&coords),
                    coords,
                    offset,
                    local,
                }
            })
            .collect()
    }
}
