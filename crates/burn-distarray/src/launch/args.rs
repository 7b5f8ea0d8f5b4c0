use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::marker::PhantomData;

use crate::runtime::DeviceId;

/// Synchronization hooks of an array whose per-device views must be kept
/// coherent around kernel execution.
pub trait Coherent: Send + Sync {
    /// Called once before any launch with the devices about to run.
    ///
    /// `is_const` is set when the kernel only reads the array.
    fn release(&self, devices: &[DeviceId], is_const: bool);

    /// Called once after every launch has completed.
    fn acquire(&self);

    /// Called right before launching on `device`.
    fn set_current_device(&self, _device: DeviceId) {}
}

/// A coherent kernel argument and whether the kernel only reads it.
pub(crate) type CoherentArg = (Arc<dyn Coherent>, bool);

/// Arguments of one kernel invocation.
///
/// Holds the address of every argument in order, as the runtime expects
/// them, and the coherence hooks of the arguments that need them. The
/// borrows keep every argument alive until the launch is issued.
#[derive(Default)]
pub struct KernelArgs<'a> {
    params: Vec<*const c_void>,
    coherent: Vec<CoherentArg>,
    _args: PhantomData<&'a ()>,
}

impl<'a> KernelArgs<'a> {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plain argument.
    pub fn arg<T>(mut self, value: &'a T) -> Self {
        self.params.push(value as *const T as *const c_void);
        self
    }

    /// Appends an argument backed by a coherent array.
    pub fn coherent_arg<T>(mut self, value: &'a T, coherent: Arc<dyn Coherent>, is_const: bool) -> Self {
        self.params.push(value as *const T as *const c_void);
        self.coherent.push((coherent, is_const));
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub(crate) fn params(&self) -> &[*const c_void] {
        &self.params
    }

    pub(crate) fn coherent(&self) -> &[CoherentArg] {
        &self.coherent
    }
}
