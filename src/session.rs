//! Accelerator session: device, context, command queue, program and kernel.
//!
//! The session is created lazily by the processor and fails closed: the first
//! stage that errors latches [`Status::Failed`] and nothing after it is
//! attempted. A failed session is never retried on its own; only
//! [`AcceleratorSession::teardown`] returns it to [`Status::Uninitialized`].

use log::{debug, error, info};

use crate::backend::{ComputeBackend, DeviceInfo};
use crate::kernel::{KERNEL_NAME, KERNEL_SOURCE};
use crate::{GrafError, Result};

/// Lifecycle of a session or a buffer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uninitialized,
    Ready,
    Failed,
}

/// Live handles. Fields drop in declaration order, which is the release
/// order: program, kernel, queue, context.
struct Resources<B: ComputeBackend> {
    program: B::Program,
    kernel: B::Kernel,
    queue: B::Queue,
    context: B::Context,
    device: DeviceInfo,
    work_group_size: usize,
}

enum SessionState<B: ComputeBackend> {
    Uninitialized,
    Ready(Resources<B>),
    Failed(String),
}

/// Disjoint borrows of a ready session, handed to the buffer set and the
/// dispatch path.
pub struct SessionParts<'a, B: ComputeBackend> {
    pub backend: &'a mut B,
    pub context: &'a B::Context,
    pub queue: &'a B::Queue,
    pub kernel: &'a mut B::Kernel,
    /// Maximum work-group size queried for the kernel.
    pub local_size: usize,
}

pub struct AcceleratorSession<B: ComputeBackend> {
    backend: B,
    device_index: usize,
    state: SessionState<B>,
}

impl<B: ComputeBackend> AcceleratorSession<B> {
    pub fn new(backend: B, device_index: usize) -> Self {
        Self {
            backend,
            device_index,
            state: SessionState::Uninitialized,
        }
    }

    pub fn status(&self) -> Status {
        match self.state {
            SessionState::Uninitialized => Status::Uninitialized,
            SessionState::Ready(_) => Status::Ready,
            SessionState::Failed(_) => Status::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SessionState::Ready(_))
    }

    /// Message of the error that latched the session.
    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            SessionState::Failed(msg) => Some(msg),
            _ => None,
        }
    }

    /// Selected device, once ready.
    pub fn device(&self) -> Option<&DeviceInfo> {
        match &self.state {
            SessionState::Ready(res) => Some(&res.device),
            _ => None,
        }
    }

    pub fn work_group_size(&self) -> Option<usize> {
        match &self.state {
            SessionState::Ready(res) => Some(res.work_group_size),
            _ => None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Bring the session up.
    ///
    /// No-op when already ready. A latched session returns
    /// [`GrafError::Latched`] without touching the backend.
    pub fn initialize(&mut self) -> Result<()> {
        match &self.state {
            SessionState::Ready(_) => return Ok(()),
            SessionState::Failed(msg) => return Err(GrafError::Latched(msg.clone())),
            SessionState::Uninitialized => {}
        }

        match self.open() {
            Ok(res) => {
                info!(
                    "{} session ready on device {} ({}), work group size {}",
                    self.backend.label(),
                    res.device.index,
                    res.device.name,
                    res.work_group_size
                );
                self.state = SessionState::Ready(res);
                Ok(())
            }
            Err(e) => {
                if let GrafError::ProgramBuild { log } = &e {
                    error!("kernel build log:\n{}", log);
                }
                error!("{} session initialization failed: {}", self.backend.label(), e);
                self.state = SessionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn open(&mut self) -> Result<Resources<B>> {
        let devices = self.backend.enumerate_devices()?;
        for d in &devices {
            info!("{} device {}: {} ({:?})", self.backend.label(), d.index, d.name, d.kind);
        }
        let device = devices.get(self.device_index).cloned().ok_or(GrafError::NoDevice {
            index: self.device_index,
            available: devices.len(),
        })?;

        let name = self.backend.device_name(&device)?;
        info!("selected device {}: {}", device.index, name);

        let context = self.backend.create_context(&device)?;
        let queue = self.backend.create_queue(&context)?;
        let program = self.backend.build_program(&context, KERNEL_SOURCE)?;
        let kernel = self.backend.create_kernel(&program, KERNEL_NAME)?;
        let work_group_size = self.backend.work_group_size(&kernel)?.max(1);

        Ok(Resources {
            program,
            kernel,
            queue,
            context,
            device,
            work_group_size,
        })
    }

    /// Release every handle and return to `Uninitialized`. Safe to call in
    /// any state, any number of times.
    pub fn teardown(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Uninitialized) {
            SessionState::Ready(res) => {
                debug!("{} session released (device {})", self.backend.label(), res.device.index);
                drop(res);
            }
            SessionState::Failed(msg) => debug!("cleared failed session: {}", msg),
            SessionState::Uninitialized => {}
        }
    }

    /// Borrow the live handles. `None` unless ready.
    pub fn parts(&mut self) -> Option<SessionParts<'_, B>> {
        match &mut self.state {
            SessionState::Ready(res) => Some(SessionParts {
                backend: &mut self.backend,
                context: &res.context,
                queue: &res.queue,
                kernel: &mut res.kernel,
                local_size: res.work_group_size,
            }),
            _ => None,
        }
    }
}

impl<B: ComputeBackend> Drop for AcceleratorSession<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
