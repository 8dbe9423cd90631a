//! The accelerated-device backend.
//!
//! Layers constructed with [`Backend::Accelerated`](crate::Backend) run
//! their arithmetic as wgpu compute pipelines, composed from the same
//! unroll+matmul decomposition as the native path. The backend is logically
//! synchronous: every host-visible result is mapped back before the layer
//! call returns, so a driver can interleave the two backends freely.

mod array;
mod device;
mod ops;

pub(crate) mod layers;

pub use device::GpuContext;

/// Whether a compute-capable adapter can be opened at all.
pub fn is_available() -> bool {
    GpuContext::new().is_ok()
}

#[cfg(test)]
mod test;
