//! Device buffers for one `(bin_size, time_size)` configuration.
//!
//! | Buffer | Length | Access |
//! |--------|--------|--------|
//! | input  | `bin_size` | host writes |
//! | output | `bin_size` | host reads |
//! | past   | `bin_size * (time_size - 1)` | host writes |
//! | coeffs | `bin_size * time_size * bin_size` | host writes once |
//!
//! Lengths are clamped to at least one element since OpenCL rejects
//! zero-sized buffers (`past` is empty when `time_size == 1`).
//!
//! With [`TransferMode::Copy`] every transfer is an explicit write or read.
//! With [`TransferMode::ZeroCopy`] the buffers wrap host memory they own and
//! every transfer maps that memory in place instead.

use log::{debug, error};

use crate::backend::{BufferAccess, ComputeBackend, KernelBindings};
use crate::coefficients::Coefficients;
use crate::config::TransferMode;
use crate::index::history_index;
use crate::rolling::HistoryRing;
use crate::session::{SessionParts, Status};
use crate::{GrafError, Result};

struct Buffers<B: ComputeBackend> {
    input: B::Buffer,
    output: B::Buffer,
    past: B::Buffer,
    coeffs: B::Buffer,
    bin_size: usize,
    time_size: usize,
}

enum BufferState<B: ComputeBackend> {
    Uninitialized,
    Ready(Buffers<B>),
    Failed(String),
}

pub struct DeviceBufferSet<B: ComputeBackend> {
    transfer: TransferMode,
    state: BufferState<B>,
}

impl<B: ComputeBackend> DeviceBufferSet<B> {
    pub fn new(transfer: TransferMode) -> Self {
        Self {
            transfer,
            state: BufferState::Uninitialized,
        }
    }

    pub fn status(&self) -> Status {
        match self.state {
            BufferState::Uninitialized => Status::Uninitialized,
            BufferState::Ready(_) => Status::Ready,
            BufferState::Failed(_) => Status::Failed,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, BufferState::Ready(_))
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.state {
            BufferState::Failed(msg) => Some(msg),
            _ => None,
        }
    }

    /// `bin_size` the current buffers were sized for.
    pub fn bin_size(&self) -> Option<usize> {
        match &self.state {
            BufferState::Ready(b) => Some(b.bin_size),
            _ => None,
        }
    }

    /// Release any existing buffers, then create, fill and bind a new set.
    ///
    /// The first failing call latches `Failed`.
    pub fn allocate(
        &mut self,
        parts: &mut SessionParts<'_, B>,
        coefficients: &Coefficients,
        ring: &HistoryRing,
    ) -> Result<()> {
        self.release();
        match self.create(parts, coefficients, ring) {
            Ok(buffers) => {
                debug!(
                    "allocated device buffers: bin_size {}, time_size {}, {} coefficients",
                    buffers.bin_size,
                    buffers.time_size,
                    coefficients.len()
                );
                self.state = BufferState::Ready(buffers);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn create(
        &mut self,
        parts: &mut SessionParts<'_, B>,
        coefficients: &Coefficients,
        ring: &HistoryRing,
    ) -> Result<Buffers<B>> {
        let bin_size = ring.bin_size();
        let time_size = coefficients.time_size();
        if coefficients.bin_size() != bin_size || ring.slots() + 1 != time_size {
            return Err(GrafError::Config(format!(
                "coefficients are {}x{} but the history ring is {}x{}",
                coefficients.bin_size(),
                time_size,
                bin_size,
                ring.slots() + 1
            )));
        }

        let ctx = parts.context;
        let mode = self.transfer;
        let mut make = |len: usize, access| parts.backend.create_buffer(ctx, len.max(1), access, mode);
        let input = make(bin_size, BufferAccess::ReadOnly)?;
        let output = make(bin_size, BufferAccess::WriteOnly)?;
        let mut past = make(ring.as_slice().len(), BufferAccess::ReadOnly)?;
        let mut coeffs = make(coefficients.len(), BufferAccess::ReadOnly)?;

        upload(parts, mode, &mut coeffs, 0, coefficients.as_slice())?;
        if !ring.is_empty() {
            upload(parts, mode, &mut past, 0, ring.as_slice())?;
        }

        parts.backend.bind(
            parts.kernel,
            KernelBindings {
                input: &input,
                output: &output,
                past: &past,
                coeffs: &coeffs,
                bin_size,
                time_size,
            },
        )?;

        Ok(Buffers {
            input,
            output,
            past,
            coeffs,
            bin_size,
            time_size,
        })
    }

    /// Latch `Failed`, dropping any live buffers.
    pub(crate) fn fail(&mut self, err: &GrafError) {
        error!("device buffer setup failed: {}", err);
        self.state = BufferState::Failed(err.to_string());
    }

    /// Drop every buffer and return to `Uninitialized`, clearing a latched
    /// failure.
    pub fn release(&mut self) {
        match std::mem::replace(&mut self.state, BufferState::Uninitialized) {
            BufferState::Ready(b) => debug!("released device buffers (bin_size {})", b.bin_size),
            BufferState::Failed(msg) => debug!("cleared failed buffer set: {}", msg),
            BufferState::Uninitialized => {}
        }
    }

    fn ready(&mut self) -> Result<&mut Buffers<B>> {
        match &mut self.state {
            BufferState::Ready(b) => Ok(b),
            BufferState::Failed(msg) => Err(GrafError::Latched(msg.clone())),
            BufferState::Uninitialized => Err(GrafError::Latched("device buffers not allocated".to_string())),
        }
    }

    pub fn write_input(&mut self, parts: &mut SessionParts<'_, B>, input: &[f64]) -> Result<()> {
        let mode = self.transfer;
        let b = self.ready()?;
        upload(parts, mode, &mut b.input, 0, input)
    }

    pub fn read_output(&mut self, parts: &mut SessionParts<'_, B>, output: &mut [f64]) -> Result<()> {
        let mode = self.transfer;
        let b = self.ready()?;
        match mode {
            TransferMode::Copy => parts.backend.read(parts.queue, &b.output, output),
            TransferMode::ZeroCopy => parts.backend.read_mapped(parts.queue, &b.output, output),
        }
    }

    /// Upload one ring slot.
    pub fn write_history_slot(&mut self, parts: &mut SessionParts<'_, B>, ring: &HistoryRing, slot: usize) -> Result<()> {
        let mode = self.transfer;
        let b = self.ready()?;
        let offset = history_index(0, slot, b.bin_size);
        upload(parts, mode, &mut b.past, offset, ring.slot(slot))
    }

    /// Upload the whole ring.
    pub fn write_history(&mut self, parts: &mut SessionParts<'_, B>, ring: &HistoryRing) -> Result<()> {
        let mode = self.transfer;
        let b = self.ready()?;
        if ring.is_empty() {
            return Ok(());
        }
        upload(parts, mode, &mut b.past, 0, ring.as_slice())
    }
}

fn upload<B: ComputeBackend>(
    parts: &mut SessionParts<'_, B>,
    mode: TransferMode,
    buffer: &mut B::Buffer,
    offset: usize,
    data: &[f64],
) -> Result<()> {
    match mode {
        TransferMode::Copy => parts.backend.write(parts.queue, buffer, offset, data),
        TransferMode::ZeroCopy => parts.backend.write_mapped(parts.queue, buffer, offset, data),
    }
}
