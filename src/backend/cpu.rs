//! Host fallback backend: the `system` kernel evaluated on a rayon thread pool.
//!
//! Buffers are plain host vectors. A mapped transfer works on the store in
//! place under its lock, so it is the same memory traffic as a copy; the
//! distinction only matters on devices with their own memory.
//! Work runs to completion inside [`ComputeBackend::enqueue`]; `wait` only
//! hands back the result.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{BufferAccess, ComputeBackend, DeviceInfo, DeviceKind, KernelBindings};
use crate::config::TransferMode;
use crate::kernel::{entry_points, SystemArgs};
use crate::{GrafError, Result};

/// Work-group size reported for the host device.
pub const CPU_WORK_GROUP_SIZE: usize = 256;

pub struct CpuContext {
    pool: Arc<ThreadPool>,
}

pub struct CpuQueue {
    pool: Arc<ThreadPool>,
}

pub struct CpuProgram {
    entry_points: Vec<String>,
}

pub struct CpuKernel {
    name: String,
    bound: Option<BoundArgs>,
    time_offset: usize,
}

type HostStore = RwLock<Vec<f64>>;

// Weak so that dropping a buffer frees its memory even while a kernel still
// refers to it.
struct BoundArgs {
    input: Weak<HostStore>,
    output: Weak<HostStore>,
    past: Weak<HostStore>,
    coeffs: Weak<HostStore>,
    bin_size: usize,
    time_size: usize,
}

/// Host memory owned by one buffer handle. Kernels only hold weak references.
pub struct CpuBuffer {
    data: Arc<HostStore>,
    access: BufferAccess,
    transfer: TransferMode,
}

impl CpuBuffer {
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn access(&self) -> BufferAccess {
        self.access
    }

    pub fn transfer(&self) -> TransferMode {
        self.transfer
    }

    fn store_mut(&self, err: fn(String) -> GrafError) -> Result<RwLockWriteGuard<'_, Vec<f64>>> {
        self.data.write().map_err(|_| err("buffer lock poisoned".to_string()))
    }

    fn store(&self, err: fn(String) -> GrafError) -> Result<RwLockReadGuard<'_, Vec<f64>>> {
        self.data.read().map_err(|_| err("buffer lock poisoned".to_string()))
    }
}

fn copy_in(dst: &mut [f64], offset: usize, data: &[f64]) -> Result<()> {
    let end = offset + data.len();
    if end > dst.len() {
        return Err(GrafError::Write(format!(
            "write of {}..{} past buffer of {}",
            offset,
            end,
            dst.len()
        )));
    }
    dst[offset..end].copy_from_slice(data);
    Ok(())
}

fn copy_out(src: &[f64], out: &mut [f64]) -> Result<()> {
    if out.len() > src.len() {
        return Err(GrafError::Read(format!(
            "read of {} values from buffer of {}",
            out.len(),
            src.len()
        )));
    }
    out.copy_from_slice(&src[..out.len()]);
    Ok(())
}

fn upgrade(store: &Weak<HostStore>, name: &str) -> Result<Arc<HostStore>> {
    store
        .upgrade()
        .ok_or_else(|| GrafError::Enqueue(format!("{} buffer released while bound", name)))
}

/// Completed work item.
pub struct CpuPending {
    result: Result<()>,
}

/// Runs the kernel on the host.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    threads: Option<usize>,
}

impl CpuBackend {
    /// Use rayon's default thread count.
    pub fn new() -> Self {
        Self { threads: None }
    }

    /// Fix the number of worker threads.
    ///
    /// For real-time audio keep this small (1-2) to limit scheduling jitter.
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads: Some(threads.max(1)),
        }
    }

    fn thread_count(&self) -> usize {
        self.threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }
}

impl ComputeBackend for CpuBackend {
    type Context = CpuContext;
    type Queue = CpuQueue;
    type Program = CpuProgram;
    type Kernel = CpuKernel;
    type Buffer = CpuBuffer;
    type Pending = CpuPending;

    fn label(&self) -> &'static str {
        "cpu"
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            index: 0,
            name: format!("host cpu ({} threads)", self.thread_count()),
            kind: DeviceKind::Cpu,
            max_work_group_size: CPU_WORK_GROUP_SIZE,
        }])
    }

    fn device_name(&mut self, device: &DeviceInfo) -> Result<String> {
        if device.index != 0 {
            return Err(GrafError::DeviceQuery(format!("no host device at index {}", device.index)));
        }
        Ok(format!("host cpu ({} threads)", self.thread_count()))
    }

    fn create_context(&mut self, _device: &DeviceInfo) -> Result<CpuContext> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.thread_count())
            .thread_name(|i| format!("graf-cpu-{}", i))
            .build()
            .map_err(|e| GrafError::Context(e.to_string()))?;
        Ok(CpuContext {
            pool: Arc::new(pool),
        })
    }

    fn create_queue(&mut self, context: &CpuContext) -> Result<CpuQueue> {
        Ok(CpuQueue {
            pool: Arc::clone(&context.pool),
        })
    }

    fn build_program(&mut self, _context: &CpuContext, source: &str) -> Result<CpuProgram> {
        let entry_points = entry_points(source);
        if entry_points.is_empty() {
            return Err(GrafError::ProgramBuild {
                log: "source declares no __kernel entry point".to_string(),
            });
        }
        Ok(CpuProgram { entry_points })
    }

    fn create_kernel(&mut self, program: &CpuProgram, entry: &str) -> Result<CpuKernel> {
        if !program.entry_points.iter().any(|e| e == entry) {
            return Err(GrafError::KernelCreate(format!(
                "entry point '{}' not found (program has {:?})",
                entry, program.entry_points
            )));
        }
        Ok(CpuKernel {
            name: entry.to_string(),
            bound: None,
            time_offset: 0,
        })
    }

    fn work_group_size(&mut self, _kernel: &CpuKernel) -> Result<usize> {
        Ok(CPU_WORK_GROUP_SIZE)
    }

    fn create_buffer(
        &mut self,
        _context: &CpuContext,
        len: usize,
        access: BufferAccess,
        transfer: TransferMode,
    ) -> Result<CpuBuffer> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| GrafError::BufferAlloc(format!("{} doubles: {}", len, e)))?;
        data.resize(len, 0.0);
        Ok(CpuBuffer {
            data: Arc::new(RwLock::new(data)),
            access,
            transfer,
        })
    }

    fn bind(&mut self, kernel: &mut CpuKernel, bindings: KernelBindings<'_, CpuBuffer>) -> Result<()> {
        let plane = bindings.bin_size * bindings.time_size;
        if bindings.input.len() < bindings.bin_size
            || bindings.output.len() < bindings.bin_size
            || bindings.coeffs.len() < plane * bindings.bin_size
        {
            return Err(GrafError::KernelArg(format!(
                "buffers too small for bin_size {} / time_size {}",
                bindings.bin_size, bindings.time_size
            )));
        }
        kernel.bound = Some(BoundArgs {
            input: Arc::downgrade(&bindings.input.data),
            output: Arc::downgrade(&bindings.output.data),
            past: Arc::downgrade(&bindings.past.data),
            coeffs: Arc::downgrade(&bindings.coeffs.data),
            bin_size: bindings.bin_size,
            time_size: bindings.time_size,
        });
        Ok(())
    }

    fn set_time_offset(&mut self, kernel: &mut CpuKernel, time_offset: usize) -> Result<()> {
        kernel.time_offset = time_offset;
        Ok(())
    }

    fn write(&mut self, _queue: &CpuQueue, buffer: &mut CpuBuffer, offset: usize, data: &[f64]) -> Result<()> {
        copy_in(&mut buffer.store_mut(GrafError::Write)?, offset, data)
    }

    fn read(&mut self, _queue: &CpuQueue, buffer: &CpuBuffer, out: &mut [f64]) -> Result<()> {
        copy_out(&buffer.store(GrafError::Read)?, out)
    }

    fn write_mapped(&mut self, _queue: &CpuQueue, buffer: &mut CpuBuffer, offset: usize, data: &[f64]) -> Result<()> {
        copy_in(&mut buffer.store_mut(GrafError::Map)?, offset, data)
    }

    fn read_mapped(&mut self, _queue: &CpuQueue, buffer: &CpuBuffer, out: &mut [f64]) -> Result<()> {
        copy_out(&buffer.store(GrafError::Map)?, out)
    }

    fn enqueue(&mut self, queue: &CpuQueue, kernel: &CpuKernel, global_size: usize, _local_size: usize) -> Result<CpuPending> {
        let bound = kernel
            .bound
            .as_ref()
            .ok_or_else(|| GrafError::Enqueue(format!("kernel '{}' has unbound arguments", kernel.name)))?;
        if global_size < bound.bin_size {
            return Err(GrafError::Enqueue(format!(
                "global size {} smaller than bin_size {}",
                global_size, bound.bin_size
            )));
        }

        let input = upgrade(&bound.input, "input")?;
        let output = upgrade(&bound.output, "output")?;
        let past = upgrade(&bound.past, "past")?;
        let coeffs = upgrade(&bound.coeffs, "coefficient")?;

        let poisoned = || GrafError::Enqueue("buffer lock poisoned".to_string());
        let input = input.read().map_err(|_| poisoned())?;
        let past = past.read().map_err(|_| poisoned())?;
        let coeffs = coeffs.read().map_err(|_| poisoned())?;
        let mut output = output.write().map_err(|_| poisoned())?;

        let args = SystemArgs {
            input: &input[..bound.bin_size],
            past: &past,
            coeffs: &coeffs,
            bin_size: bound.bin_size,
            time_size: bound.time_size,
            time_offset: kernel.time_offset,
        };
        let out = &mut output[..bound.bin_size];
        queue.pool.install(|| args.evaluate(out));

        Ok(CpuPending { result: Ok(()) })
    }

    fn wait(&mut self, _queue: &CpuQueue, pending: CpuPending) -> Result<()> {
        pending.result
    }
}
