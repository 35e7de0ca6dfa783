//! Parallel compute backends.
//!
//! A backend exposes the handful of accelerator operations the engine needs:
//! device discovery, context and queue creation, program compilation, kernel
//! creation, buffer management, argument binding, enqueue and completion wait.
//! The session and buffer set drive these in a fixed order and own every handle
//! they return; dropping a handle releases the underlying resource.
//!
//! - [`cpu::CpuBackend`] runs the kernel on a rayon thread pool. Always available.
//! - `opencl::OpenClBackend` compiles `kernels/system.cl` with the platform's
//!   OpenCL driver. Requires the `opencl` feature.

pub mod cpu;
#[cfg(feature = "opencl")]
pub mod opencl;
#[cfg(test)]
pub(crate) mod testing;

use crate::config::TransferMode;
use crate::Result;

/// Broad class of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

/// One entry of a backend's device list.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Position in the enumerated list; this is what the config selects by.
    pub index: usize,
    pub name: String,
    pub kind: DeviceKind,
    pub max_work_group_size: usize,
}

/// Which side reads and which side writes a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    /// Host writes, kernel reads.
    ReadOnly,
    /// Kernel writes, host reads.
    WriteOnly,
}

/// Buffer and scalar arguments fixed for the lifetime of a buffer set.
pub struct KernelBindings<'a, B> {
    pub input: &'a B,
    pub output: &'a B,
    pub past: &'a B,
    pub coeffs: &'a B,
    pub bin_size: usize,
    pub time_size: usize,
}

/// Accelerator operations used by [`crate::session::AcceleratorSession`] and
/// [`crate::buffers::DeviceBufferSet`].
///
/// Every call is fallible and is checked individually by the caller.
pub trait ComputeBackend: Send {
    type Context: Send;
    type Queue: Send;
    type Program: Send;
    type Kernel: Send;
    type Buffer: Send;
    /// Handle to enqueued work; consumed by [`ComputeBackend::wait`].
    type Pending;

    /// Short backend label for logs.
    fn label(&self) -> &'static str;

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>>;

    /// Re-query the name of a selected device.
    fn device_name(&mut self, device: &DeviceInfo) -> Result<String>;

    fn create_context(&mut self, device: &DeviceInfo) -> Result<Self::Context>;

    fn create_queue(&mut self, context: &Self::Context) -> Result<Self::Queue>;

    /// Compile `source`. Build failures carry the compiler log.
    fn build_program(&mut self, context: &Self::Context, source: &str) -> Result<Self::Program>;

    fn create_kernel(&mut self, program: &Self::Program, entry: &str) -> Result<Self::Kernel>;

    /// Largest work-group size usable with `kernel` on the selected device.
    fn work_group_size(&mut self, kernel: &Self::Kernel) -> Result<usize>;

    fn create_buffer(
        &mut self,
        context: &Self::Context,
        len: usize,
        access: BufferAccess,
        transfer: TransferMode,
    ) -> Result<Self::Buffer>;

    /// Bind the four buffers and the static scalars.
    fn bind(&mut self, kernel: &mut Self::Kernel, bindings: KernelBindings<'_, Self::Buffer>) -> Result<()>;

    /// Set the per-block `time_offset` scalar.
    fn set_time_offset(&mut self, kernel: &mut Self::Kernel, time_offset: usize) -> Result<()>;

    /// Blocking host-to-device copy of `data` at element `offset`.
    fn write(
        &mut self,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        offset: usize,
        data: &[f64],
    ) -> Result<()>;

    /// Blocking device-to-host copy from the start of `buffer`.
    fn read(&mut self, queue: &Self::Queue, buffer: &Self::Buffer, out: &mut [f64]) -> Result<()>;

    /// Map `data.len()` elements at `offset` into host memory, fill them and
    /// unmap. For [`TransferMode::ZeroCopy`] buffers the mapped region is the
    /// buffer's own host store, so nothing is copied to a separate allocation.
    fn write_mapped(
        &mut self,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        offset: usize,
        data: &[f64],
    ) -> Result<()>;

    /// Map the start of `buffer` for reading, copy `out.len()` elements out
    /// and unmap.
    fn read_mapped(&mut self, queue: &Self::Queue, buffer: &Self::Buffer, out: &mut [f64]) -> Result<()>;

    /// Enqueue the kernel over a 1-D range.
    fn enqueue(
        &mut self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_size: usize,
        local_size: usize,
    ) -> Result<Self::Pending>;

    /// Block until `pending` completes.
    fn wait(&mut self, queue: &Self::Queue, pending: Self::Pending) -> Result<()>;
}

/// Round `global` up to a multiple of `local` (minimum one group).
pub fn padded_global_size(global: usize, local: usize) -> usize {
    let local = local.max(1);
    global.div_ceil(local).max(1) * local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_global_size() {
        assert_eq!(padded_global_size(64, 256), 256);
        assert_eq!(padded_global_size(256, 256), 256);
        assert_eq!(padded_global_size(257, 256), 512);
        assert_eq!(padded_global_size(5, 0), 5);
        assert_eq!(padded_global_size(0, 8), 8);
    }
}
