//! Test backend: the CPU backend plus a call log and fault injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::cpu::{CpuBackend, CpuBuffer, CpuContext, CpuKernel, CpuPending, CpuProgram, CpuQueue};
use super::{BufferAccess, ComputeBackend, DeviceInfo, KernelBindings};
use crate::config::TransferMode;
use crate::{GrafError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Stage {
    Enumerate,
    DeviceName,
    Context,
    Queue,
    Build,
    Kernel,
    WorkGroup,
    Buffer,
    Bind,
    TimeOffset,
    Write,
    Read,
    Map,
    Enqueue,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Attempt(Stage),
    CreateBuffer(usize),
    Write { offset: usize, len: usize },
    MapWrite { offset: usize, len: usize },
    MapRead { len: usize },
    Enqueue { global: usize, local: usize },
    Release(Resource),
}

#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut calls) = self.0.lock() {
            calls.clear();
        }
    }

    pub(crate) fn releases(&self) -> Vec<Resource> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Release(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

/// Handle wrapper that logs its own release.
pub(crate) struct Tracked<T> {
    inner: T,
    resource: Resource,
    log: CallLog,
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.log.push(Call::Release(self.resource));
    }
}

#[derive(Debug, Clone, Copy)]
enum FailMode {
    Always,
    /// Fail only the n-th call (0-based) of the stage.
    Nth(usize),
}

pub(crate) struct RecordingBackend {
    inner: CpuBackend,
    log: CallLog,
    faults: HashMap<Stage, FailMode>,
    counts: HashMap<Stage, usize>,
}

impl RecordingBackend {
    pub(crate) fn new() -> Self {
        Self {
            inner: CpuBackend::with_threads(1),
            log: CallLog::default(),
            faults: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    pub(crate) fn failing(stage: Stage) -> Self {
        let mut b = Self::new();
        b.faults.insert(stage, FailMode::Always);
        b
    }

    pub(crate) fn failing_nth(stage: Stage, nth: usize) -> Self {
        let mut b = Self::new();
        b.faults.insert(stage, FailMode::Nth(nth));
        b
    }

    pub(crate) fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn attempt(&mut self, stage: Stage) -> Result<()> {
        self.log.push(Call::Attempt(stage));
        let count = self.counts.entry(stage).or_insert(0);
        let n = *count;
        *count += 1;
        let fail = match self.faults.get(&stage) {
            Some(FailMode::Always) => true,
            Some(FailMode::Nth(k)) => *k == n,
            None => false,
        };
        if !fail {
            return Ok(());
        }
        let msg = format!("injected {:?} failure", stage);
        Err(match stage {
            Stage::Enumerate | Stage::DeviceName | Stage::WorkGroup => GrafError::DeviceQuery(msg),
            Stage::Context => GrafError::Context(msg),
            Stage::Queue => GrafError::Queue(msg),
            Stage::Build => GrafError::ProgramBuild { log: msg },
            Stage::Kernel => GrafError::KernelCreate(msg),
            Stage::Buffer => GrafError::BufferAlloc(msg),
            Stage::Bind | Stage::TimeOffset => GrafError::KernelArg(msg),
            Stage::Write => GrafError::Write(msg),
            Stage::Read => GrafError::Read(msg),
            Stage::Enqueue => GrafError::Enqueue(msg),
            Stage::Map => GrafError::Map(msg),
            Stage::Wait => GrafError::Wait(msg),
        })
    }

    fn track<T>(&self, inner: T, resource: Resource) -> Tracked<T> {
        Tracked {
            inner,
            resource,
            log: self.log.clone(),
        }
    }
}

impl ComputeBackend for RecordingBackend {
    type Context = Tracked<CpuContext>;
    type Queue = Tracked<CpuQueue>;
    type Program = Tracked<CpuProgram>;
    type Kernel = Tracked<CpuKernel>;
    type Buffer = Tracked<CpuBuffer>;
    type Pending = CpuPending;

    fn label(&self) -> &'static str {
        "recording"
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        self.attempt(Stage::Enumerate)?;
        self.inner.enumerate_devices()
    }

    fn device_name(&mut self, device: &DeviceInfo) -> Result<String> {
        self.attempt(Stage::DeviceName)?;
        self.inner.device_name(device)
    }

    fn create_context(&mut self, device: &DeviceInfo) -> Result<Self::Context> {
        self.attempt(Stage::Context)?;
        let ctx = self.inner.create_context(device)?;
        Ok(self.track(ctx, Resource::Context))
    }

    fn create_queue(&mut self, context: &Self::Context) -> Result<Self::Queue> {
        self.attempt(Stage::Queue)?;
        let queue = self.inner.create_queue(&context.inner)?;
        Ok(self.track(queue, Resource::Queue))
    }

    fn build_program(&mut self, context: &Self::Context, source: &str) -> Result<Self::Program> {
        self.attempt(Stage::Build)?;
        let program = self.inner.build_program(&context.inner, source)?;
        Ok(self.track(program, Resource::Program))
    }

    fn create_kernel(&mut self, program: &Self::Program, entry: &str) -> Result<Self::Kernel> {
        self.attempt(Stage::Kernel)?;
        let kernel = self.inner.create_kernel(&program.inner, entry)?;
        Ok(self.track(kernel, Resource::Kernel))
    }

    fn work_group_size(&mut self, kernel: &Self::Kernel) -> Result<usize> {
        self.attempt(Stage::WorkGroup)?;
        self.inner.work_group_size(&kernel.inner)
    }

    fn create_buffer(
        &mut self,
        context: &Self::Context,
        len: usize,
        access: BufferAccess,
        transfer: TransferMode,
    ) -> Result<Self::Buffer> {
        self.attempt(Stage::Buffer)?;
        self.log.push(Call::CreateBuffer(len));
        let buffer = self.inner.create_buffer(&context.inner, len, access, transfer)?;
        Ok(self.track(buffer, Resource::Buffer))
    }

    fn bind(&mut self, kernel: &mut Self::Kernel, bindings: KernelBindings<'_, Self::Buffer>) -> Result<()> {
        self.attempt(Stage::Bind)?;
        self.inner.bind(
            &mut kernel.inner,
            KernelBindings {
                input: &bindings.input.inner,
                output: &bindings.output.inner,
                past: &bindings.past.inner,
                coeffs: &bindings.coeffs.inner,
                bin_size: bindings.bin_size,
                time_size: bindings.time_size,
            },
        )
    }

    fn set_time_offset(&mut self, kernel: &mut Self::Kernel, time_offset: usize) -> Result<()> {
        self.attempt(Stage::TimeOffset)?;
        self.inner.set_time_offset(&mut kernel.inner, time_offset)
    }

    fn write(&mut self, queue: &Self::Queue, buffer: &mut Self::Buffer, offset: usize, data: &[f64]) -> Result<()> {
        self.attempt(Stage::Write)?;
        self.log.push(Call::Write {
            offset,
            len: data.len(),
        });
        self.inner.write(&queue.inner, &mut buffer.inner, offset, data)
    }

    fn read(&mut self, queue: &Self::Queue, buffer: &Self::Buffer, out: &mut [f64]) -> Result<()> {
        self.attempt(Stage::Read)?;
        self.inner.read(&queue.inner, &buffer.inner, out)
    }

    fn write_mapped(&mut self, queue: &Self::Queue, buffer: &mut Self::Buffer, offset: usize, data: &[f64]) -> Result<()> {
        self.attempt(Stage::Map)?;
        self.log.push(Call::MapWrite {
            offset,
            len: data.len(),
        });
        self.inner.write_mapped(&queue.inner, &mut buffer.inner, offset, data)
    }

    fn read_mapped(&mut self, queue: &Self::Queue, buffer: &Self::Buffer, out: &mut [f64]) -> Result<()> {
        self.attempt(Stage::Map)?;
        self.log.push(Call::MapRead { len: out.len() });
        self.inner.read_mapped(&queue.inner, &buffer.inner, out)
    }

    fn enqueue(
        &mut self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_size: usize,
        local_size: usize,
    ) -> Result<CpuPending> {
        self.attempt(Stage::Enqueue)?;
        self.log.push(Call::Enqueue {
            global: global_size,
            local: local_size,
        });
        self.inner.enqueue(&queue.inner, &kernel.inner, global_size, local_size)
    }

    fn wait(&mut self, queue: &Self::Queue, pending: CpuPending) -> Result<()> {
        self.attempt(Stage::Wait)?;
        self.inner.wait(&queue.inner, pending)
    }
}
