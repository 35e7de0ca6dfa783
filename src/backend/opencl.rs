//! OpenCL backend built on `opencl3`.
//!
//! # Feature Gate
//!
//! Only compiled with the `opencl` feature:
//! ```bash
//! cargo build --features opencl
//! ```
//!
//! The kernel uses `double`, so the selected device must support
//! `cl_khr_fp64`; devices without it fail at program build time and the
//! session latches `Failed` with the compiler log.

use std::ptr;

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU};
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{
    Buffer, ClMem, CL_MAP_READ, CL_MAP_WRITE_INVALIDATE_REGION, CL_MEM_READ_ONLY, CL_MEM_USE_HOST_PTR,
    CL_MEM_WRITE_ONLY,
};
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_device_type, cl_double, cl_long, cl_map_flags, cl_mem, CL_BLOCKING};

use super::{BufferAccess, ComputeBackend, DeviceInfo, DeviceKind, KernelBindings};
use crate::config::TransferMode;
use crate::kernel::{ARG_BIN_SIZE, ARG_COEFFS, ARG_INPUT, ARG_OUTPUT, ARG_PAST, ARG_TIME_OFFSET, ARG_TIME_SIZE};
use crate::{GrafError, Result};

const DOUBLE_SIZE: usize = std::mem::size_of::<cl_double>();

pub struct ClContext {
    context: Context,
    device: cl_device_id,
}

pub struct ClQueue {
    queue: CommandQueue,
}

pub struct ClProgram {
    program: Program,
    device: cl_device_id,
}

pub struct ClKernel {
    kernel: Kernel,
    device: cl_device_id,
}

/// Device buffer, optionally backed by host memory it owns.
pub struct ClBuffer {
    buffer: Buffer<cl_double>,
    // Address handed to CL_MEM_USE_HOST_PTR. Declared after `buffer` so the
    // memory object is released before its backing store.
    _host: Option<Box<[cl_double]>>,
}

pub struct ClPending {
    event: Event,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue,
// program, kernel and memory objects; the raw handles are opaque and the
// runtime serializes access internally. The engine additionally never uses a
// handle from more than one thread at a time.
unsafe impl Send for ClContext {}
unsafe impl Send for ClQueue {}
unsafe impl Send for ClProgram {}
unsafe impl Send for ClKernel {}
unsafe impl Send for ClBuffer {}
unsafe impl Send for OpenClBackend {}

/// Runs the kernel through the platform OpenCL driver.
#[derive(Debug, Default)]
pub struct OpenClBackend {
    device_ids: Vec<cl_device_id>,
}

impl OpenClBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn device_id(&self, device: &DeviceInfo) -> Result<cl_device_id> {
        self.device_ids.get(device.index).copied().ok_or(GrafError::NoDevice {
            index: device.index,
            available: self.device_ids.len(),
        })
    }
}

fn device_kind(dev_type: cl_device_type) -> DeviceKind {
    if dev_type & CL_DEVICE_TYPE_GPU != 0 {
        DeviceKind::Gpu
    } else if dev_type & CL_DEVICE_TYPE_CPU != 0 {
        DeviceKind::Cpu
    } else if dev_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceKind::Accelerator
    } else {
        DeviceKind::Other
    }
}

impl ComputeBackend for OpenClBackend {
    type Context = ClContext;
    type Queue = ClQueue;
    type Program = ClProgram;
    type Kernel = ClKernel;
    type Buffer = ClBuffer;
    type Pending = ClPending;

    fn label(&self) -> &'static str {
        "opencl"
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        let ids = get_all_devices(CL_DEVICE_TYPE_ALL)
            .map_err(|e| GrafError::DeviceQuery(format!("failed to create a device group: {}", e)))?;
        let mut infos = Vec::with_capacity(ids.len());
        for (index, &id) in ids.iter().enumerate() {
            let dev = Device::new(id);
            let name = dev
                .name()
                .map_err(|e| GrafError::DeviceQuery(format!("failed to retrieve device name: {}", e)))?;
            infos.push(DeviceInfo {
                index,
                name: name.trim().to_string(),
                kind: device_kind(dev.dev_type().unwrap_or(0)),
                max_work_group_size: dev.max_work_group_size().unwrap_or(1),
            });
        }
        self.device_ids = ids;
        Ok(infos)
    }

    fn device_name(&mut self, device: &DeviceInfo) -> Result<String> {
        let id = self.device_id(device)?;
        Device::new(id)
            .name()
            .map(|n| n.trim().to_string())
            .map_err(|e| GrafError::DeviceQuery(format!("failed to retrieve device name: {}", e)))
    }

    fn create_context(&mut self, device: &DeviceInfo) -> Result<ClContext> {
        let id = self.device_id(device)?;
        let context = Context::from_device(&Device::new(id)).map_err(|e| GrafError::Context(e.to_string()))?;
        Ok(ClContext { context, device: id })
    }

    fn create_queue(&mut self, context: &ClContext) -> Result<ClQueue> {
        // OpenCL 1.2 entry point; macOS has no 2.0 queue properties
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context.context, 0).map_err(|e| GrafError::Queue(e.to_string()))?;
        Ok(ClQueue { queue })
    }

    fn build_program(&mut self, context: &ClContext, source: &str) -> Result<ClProgram> {
        // the Err side of create_and_build_from_source is the build log
        let program = Program::create_and_build_from_source(&context.context, source, "")
            .map_err(|log| GrafError::ProgramBuild { log })?;
        Ok(ClProgram {
            program,
            device: context.device,
        })
    }

    fn create_kernel(&mut self, program: &ClProgram, entry: &str) -> Result<ClKernel> {
        let kernel = Kernel::create(&program.program, entry).map_err(|e| GrafError::KernelCreate(e.to_string()))?;
        Ok(ClKernel {
            kernel,
            device: program.device,
        })
    }

    fn work_group_size(&mut self, kernel: &ClKernel) -> Result<usize> {
        kernel
            .kernel
            .get_work_group_size(kernel.device)
            .map_err(|e| GrafError::DeviceQuery(format!("failed to retrieve kernel work group info: {}", e)))
    }

    fn create_buffer(
        &mut self,
        context: &ClContext,
        len: usize,
        access: BufferAccess,
        transfer: TransferMode,
    ) -> Result<ClBuffer> {
        // zero-sized buffers are invalid in OpenCL
        let len = len.max(1);
        let flags = match access {
            BufferAccess::ReadOnly => CL_MEM_READ_ONLY,
            BufferAccess::WriteOnly => CL_MEM_WRITE_ONLY,
        };
        let (buffer, host) = match transfer {
            TransferMode::Copy => {
                let buffer = unsafe { Buffer::<cl_double>::create(&context.context, flags, len, ptr::null_mut()) };
                (buffer, None)
            }
            TransferMode::ZeroCopy => {
                let mut host = vec![0.0; len].into_boxed_slice();
                let buffer = unsafe {
                    Buffer::<cl_double>::create(
                        &context.context,
                        flags | CL_MEM_USE_HOST_PTR,
                        len,
                        host.as_mut_ptr().cast(),
                    )
                };
                (buffer, Some(host))
            }
        };
        let buffer = buffer.map_err(|e| GrafError::BufferAlloc(format!("{} doubles: {}", len, e)))?;
        Ok(ClBuffer { buffer, _host: host })
    }

    fn bind(&mut self, kernel: &mut ClKernel, bindings: KernelBindings<'_, ClBuffer>) -> Result<()> {
        let input: cl_mem = bindings.input.buffer.get();
        let output: cl_mem = bindings.output.buffer.get();
        let past: cl_mem = bindings.past.buffer.get();
        let coeffs: cl_mem = bindings.coeffs.buffer.get();
        let bin_size = bindings.bin_size as cl_long;
        let time_size = bindings.time_size as cl_long;
        let k = &kernel.kernel;
        unsafe {
            k.set_arg(ARG_INPUT, &input)
                .and_then(|_| k.set_arg(ARG_OUTPUT, &output))
                .and_then(|_| k.set_arg(ARG_PAST, &past))
                .and_then(|_| k.set_arg(ARG_COEFFS, &coeffs))
                .and_then(|_| k.set_arg(ARG_BIN_SIZE, &bin_size))
                .and_then(|_| k.set_arg(ARG_TIME_SIZE, &time_size))
        }
        .map_err(|e| GrafError::KernelArg(e.to_string()))
    }

    fn set_time_offset(&mut self, kernel: &mut ClKernel, time_offset: usize) -> Result<()> {
        let time_offset = time_offset as cl_long;
        unsafe { kernel.kernel.set_arg(ARG_TIME_OFFSET, &time_offset) }.map_err(|e| GrafError::KernelArg(e.to_string()))
    }

    fn write(&mut self, queue: &ClQueue, buffer: &mut ClBuffer, offset: usize, data: &[f64]) -> Result<()> {
        let event = unsafe {
            queue
                .queue
                .enqueue_write_buffer(&mut buffer.buffer, CL_BLOCKING, offset * DOUBLE_SIZE, data, &[])
        }
        .map_err(|e| GrafError::Write(e.to_string()))?;
        event.wait().map_err(|e| GrafError::Write(e.to_string()))
    }

    fn read(&mut self, queue: &ClQueue, buffer: &ClBuffer, out: &mut [f64]) -> Result<()> {
        let event = unsafe { queue.queue.enqueue_read_buffer(&buffer.buffer, CL_BLOCKING, 0, out, &[]) }
            .map_err(|e| GrafError::Read(e.to_string()))?;
        event.wait().map_err(|e| GrafError::Read(e.to_string()))
    }

    fn write_mapped(&mut self, queue: &ClQueue, buffer: &mut ClBuffer, offset: usize, data: &[f64]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mapped = map(queue, buffer, CL_MAP_WRITE_INVALIDATE_REGION, offset, data.len())?;
        // SAFETY: the blocking map returned a host pointer to exactly
        // `data.len()` doubles that stays valid until the unmap below.
        unsafe { std::slice::from_raw_parts_mut(mapped.cast::<cl_double>(), data.len()) }.copy_from_slice(data);
        unmap(queue, buffer, mapped)
    }

    fn read_mapped(&mut self, queue: &ClQueue, buffer: &ClBuffer, out: &mut [f64]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let mapped = map(queue, buffer, CL_MAP_READ, 0, out.len())?;
        // SAFETY: as in `write_mapped`, valid for `out.len()` doubles until unmapped.
        out.copy_from_slice(unsafe { std::slice::from_raw_parts(mapped.cast::<cl_double>(), out.len()) });
        unmap(queue, buffer, mapped)
    }

    fn enqueue(&mut self, queue: &ClQueue, kernel: &ClKernel, global_size: usize, local_size: usize) -> Result<ClPending> {
        let global = [global_size];
        let local = [local_size];
        let event = unsafe {
            queue
                .queue
                .enqueue_nd_range_kernel(kernel.kernel.get(), 1, ptr::null(), global.as_ptr(), local.as_ptr(), &[])
        }
        .map_err(|e| GrafError::Enqueue(e.to_string()))?;
        Ok(ClPending { event })
    }

    fn wait(&mut self, queue: &ClQueue, pending: ClPending) -> Result<()> {
        pending.event.wait().map_err(|e| GrafError::Wait(e.to_string()))?;
        queue.queue.finish().map_err(|e| GrafError::Wait(e.to_string()))
    }
}

/// Blocking map of `len` doubles at element `offset`. For buffers created with
/// `CL_MEM_USE_HOST_PTR` the returned pointer addresses the owned host store.
fn map(queue: &ClQueue, buffer: &ClBuffer, flags: cl_map_flags, offset: usize, len: usize) -> Result<cl_mem> {
    let mut mapped: cl_mem = ptr::null_mut();
    let event = unsafe {
        queue.queue.enqueue_map_buffer(
            &buffer.buffer,
            CL_BLOCKING,
            flags,
            offset * DOUBLE_SIZE,
            len * DOUBLE_SIZE,
            &mut mapped,
            &[],
        )
    }
    .map_err(|e| GrafError::Map(e.to_string()))?;
    event.wait().map_err(|e| GrafError::Map(e.to_string()))?;
    if mapped.is_null() {
        return Err(GrafError::Map("driver returned a null mapping".to_string()));
    }
    Ok(mapped)
}

fn unmap(queue: &ClQueue, buffer: &ClBuffer, mapped: cl_mem) -> Result<()> {
    let event = unsafe { queue.queue.enqueue_unmap_mem_object(buffer.buffer.get(), mapped, &[]) }
        .map_err(|e| GrafError::Map(e.to_string()))?;
    event.wait().map_err(|e| GrafError::Map(e.to_string()))
}

/// List OpenCL devices without creating a session. Empty when no runtime is
/// installed.
pub fn available_devices() -> Vec<DeviceInfo> {
    OpenClBackend::new().enumerate_devices().unwrap_or_default()
}
