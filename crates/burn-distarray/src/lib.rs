#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn distributed arrays.
//!
//! Dense N-dimensional arrays spread over several accelerators through one
//! virtual address space, and kernel dispatch split over the same device
//! grid. Device primitives are abstracted by [`DeviceRuntime`](runtime::DeviceRuntime);
//! [`SimRuntime`](runtime::sim::SimRuntime) provides a host-simulated implementation.

extern crate alloc;

mod config;

pub mod error;
pub mod launch;
pub mod layout;
pub mod runtime;
pub mod sharding;
pub mod storage;

pub use config::*;
pub use launch::{GridConfig, KernelArgs, LaunchHandle, launch, launch_async};
pub use layout::{Align, ArrayLayout};
pub use storage::{DistributedStorage, VmStorage};
