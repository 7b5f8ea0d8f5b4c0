//! Mapping of computations and arrays onto a grid of devices.

mod mesh;
mod spec;

pub use mesh::*;
pub use spec::*;
