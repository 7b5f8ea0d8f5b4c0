//! Placement of array elements in device memory.

mod page;
mod vm;

pub use page::*;
pub use vm::*;

use crate::sharding::ComputeMapping;

/// Capabilities every storage layout of a distributed array provides.
pub trait DistributedStorage<T, const D: usize> {
    /// Places the array on the devices of `mapping`.
    ///
    /// Returns `false` and changes nothing if the array is already distributed.
    fn distribute<const DC: usize>(&mut self, mapping: &ComputeMapping<DC, D>) -> bool;

    /// Whether [`distribute`](DistributedStorage::distribute) has run.
    fn is_distributed(&self) -> bool;

    /// Copies the whole host buffer to device memory.
    fn to_device(&self);

    /// Copies device memory back over the whole host buffer.
    fn to_host(&mut self);

    /// Element at `(i, j, k)` in the host buffer.
    ///
    /// Only the first `D` coordinates are used, `i` being the highest-order one.
    fn access_pos(&self, i: usize, j: usize, k: usize) -> &T;

    /// Element at `(i, j, k)` in the host buffer.
    fn access_pos_mut(&mut self, i: usize, j: usize, k: usize) -> &mut T;
}
