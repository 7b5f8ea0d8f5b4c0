//! Error types and the fatal-error path of the storage and dispatch layers.

use core::fmt::Display;
use core::panic::Location;

use thiserror::Error;

use crate::runtime::{DeviceId, DevicePtr};

/// Errors reported by a [`DeviceRuntime`](crate::runtime::DeviceRuntime) primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The device index does not name an installed device.
    #[error("invalid device {device} (devices: {count})")]
    InvalidDevice {
        /// Requested device.
        device: DeviceId,
        /// Number of installed devices.
        count: usize,
    },
    /// The device could not satisfy an allocation.
    #[error("out of memory allocating {bytes} bytes on device {device}")]
    OutOfMemory {
        /// Requested size.
        bytes: usize,
        /// Device that was current.
        device: DeviceId,
    },
    /// The address does not belong to any live allocation.
    #[error("invalid device address {0}")]
    InvalidAddress(DevicePtr),
    /// A copy would run past the end of the allocation it starts in.
    #[error("copy of {len} bytes at {addr} crosses an allocation boundary")]
    CopyOutOfBounds {
        /// Start of the copy.
        addr: DevicePtr,
        /// Copy length in bytes.
        len: usize,
    },
    /// A stream or event was used while a different device was current.
    #[error("resource of device {resource} used while device {current} is current")]
    WrongDevice {
        /// Device owning the stream or event.
        resource: DeviceId,
        /// Device that was current.
        current: DeviceId,
    },
    /// The kernel launch was rejected.
    #[error("kernel launch failed: {0}")]
    Launch(String),
    /// Any other driver failure.
    #[error("driver error: {0}")]
    Driver(String),
}

/// Static configuration errors detected while computing a distribution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    /// More array axes are sharded than the computation partitions.
    #[error("not enough partitioned compute dims: {compute}, to partition {array} array dims")]
    InsufficientPartitionAxes {
        /// Partitioned compute axes.
        compute: usize,
        /// Sharded array axes.
        array: usize,
    },
    /// An array axis is sharded along a compute axis that does not exist.
    #[error("array dim {dim} is mapped to compute dim {axis}, but the computation has {dims} dims")]
    UnknownComputeAxis {
        /// Array axis.
        dim: usize,
        /// Requested compute axis.
        axis: usize,
        /// Number of compute axes.
        dims: usize,
    },
}

/// Errors reported while loading a [`DistConfig`](crate::DistConfig).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable does not hold a valid value.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },
    /// The granule must be a non-zero power of two.
    #[error("granule size {0} is not a non-zero power of two")]
    InvalidGranule(usize),
}

/// Logs the call site and a formatted message, then aborts the current operation.
///
/// Used for every failure this layer cannot recover from: configuration
/// errors, broken allocation topology and device-runtime errors.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("{}:{}", file!(), line!());
        log::error!($($arg)*);
        panic!($($arg)*)
    }};
}

pub(crate) use fatal;

/// Turns a failed device or configuration result into a fatal error.
pub(crate) trait OrFatal<T> {
    /// Returns the value, or logs the caller location and panics with `what: error`.
    fn or_fatal(self, what: &str) -> T;
}

impl<T, E: Display> OrFatal<T> for Result<T, E> {
    #[track_caller]
    fn or_fatal(self, what: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                let location = Location::caller();
                log::error!("{}:{}", location.file(), location.line());
                log::error!("{what}: {err}");
                panic!("{what}: {err}")
            }
        }
    }
}
