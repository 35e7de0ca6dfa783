//! Per-block dispatch engine.
//!
//! [`GrafProcessor::process`] is the real-time entry point. It never returns an
//! error and never panics on accelerator failure: every problem is logged,
//! counted in [`DispatchStats`], and the output block is filled according to
//! the configured [`FailurePolicy`](crate::FailurePolicy).

use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::backend::cpu::CpuBackend;
use crate::backend::{padded_global_size, ComputeBackend, DeviceInfo};
use crate::buffers::DeviceBufferSet;
use crate::coefficients::CoefficientSource;
use crate::config::GrafConfig;
use crate::rolling::HistoryRing;
use crate::session::{AcceleratorSession, Status};
use crate::{GrafError, Result};

/// Silent blocks run by [`GrafProcessor::warmup`].
const WARMUP_BLOCKS: usize = 3;

/// Observable lifecycle of a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// No block processed yet (or reset since).
    Uninitialized,
    /// Session up; `bin_size` is the size the device buffers were built for.
    Ready { bin_size: Option<usize> },
    /// Latched until [`GrafProcessor::reset`].
    Failed(String),
    /// Shut down; blocks get failure-policy output until reset.
    Closed,
}

/// Running counters. Cumulative across [`GrafProcessor::reset`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchStats {
    /// Calls to `process` with a non-empty block.
    pub blocks: u64,
    /// Blocks whose output came from the kernel.
    pub dispatches: u64,
    /// Blocks that made no device calls (engine failed or closed).
    pub skipped: u64,
    /// Blocks whose dispatch failed transiently.
    pub dispatch_errors: u64,
    /// Blocks that arrived while a dispatch was still marked in flight.
    pub overruns: u64,
    /// Blocks that took longer than their duration at the given sample rate.
    pub deadline_misses: u64,
    /// Buffer reallocations caused by block-size changes.
    pub reallocations: u64,
    pub last_dispatch: Duration,
    pub max_dispatch: Duration,
}

impl DispatchStats {
    fn record(&mut self, elapsed: Duration) {
        self.last_dispatch = elapsed;
        self.max_dispatch = self.max_dispatch.max(elapsed);
    }
}

/// Block processor driving one accelerator session.
///
/// Everything is created lazily on the first call to [`process`](Self::process):
/// the session, then device buffers sized for that block. A later block of a
/// different length reallocates the buffers and reuses the session.
pub struct GrafProcessor<B: ComputeBackend = CpuBackend> {
    config: GrafConfig,
    source: Box<dyn CoefficientSource>,
    // buffers before session: device memory goes before its context
    buffers: DeviceBufferSet<B>,
    session: AcceleratorSession<B>,
    ring: HistoryRing,
    attempted: bool,
    closed: bool,
    history_dirty: bool,
    in_flight: bool,
    stats: DispatchStats,
}

impl GrafProcessor<CpuBackend> {
    /// Processor on the host backend with rayon's default thread count.
    pub fn new(config: GrafConfig, source: impl CoefficientSource + 'static) -> Result<Self> {
        Self::with_backend(CpuBackend::new(), config, source)
    }

    /// Processor on the host backend with a fixed worker count.
    ///
    /// - For real-time audio: use 1-2 to minimize latency variance
    /// - For batch/offline: use more for throughput
    pub fn with_threads(config: GrafConfig, source: impl CoefficientSource + 'static, threads: usize) -> Result<Self> {
        Self::with_backend(CpuBackend::with_threads(threads), config, source)
    }
}

#[cfg(feature = "opencl")]
impl GrafProcessor<crate::backend::opencl::OpenClBackend> {
    /// Processor on the OpenCL device selected by `config.device_index`.
    pub fn opencl(config: GrafConfig, source: impl CoefficientSource + 'static) -> Result<Self> {
        Self::with_backend(crate::backend::opencl::OpenClBackend::new(), config, source)
    }
}

impl<B: ComputeBackend> GrafProcessor<B> {
    /// Processor on any backend. Validates `config`; no device work happens
    /// until the first block.
    pub fn with_backend(backend: B, config: GrafConfig, source: impl CoefficientSource + 'static) -> Result<Self> {
        let config = config.validated()?;
        Ok(Self {
            buffers: DeviceBufferSet::new(config.transfer),
            session: AcceleratorSession::new(backend, config.device_index),
            ring: HistoryRing::new(0, config.time_size),
            source: Box::new(source),
            config,
            attempted: false,
            closed: false,
            history_dirty: false,
            in_flight: false,
            stats: DispatchStats::default(),
        })
    }

    /// Validated configuration this processor was built with.
    pub fn config(&self) -> &GrafConfig {
        &self.config
    }

    /// Counters since construction.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Host copy of the block history.
    pub fn history(&self) -> &HistoryRing {
        &self.ring
    }

    /// Selected device once the session is up.
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.session.device()
    }

    /// Current lifecycle state. A latched failure wins over `Closed`.
    pub fn state(&self) -> EngineState {
        if let Some(msg) = self.session.failure().or_else(|| self.buffers.failure()) {
            return EngineState::Failed(msg.to_string());
        }
        if self.closed {
            return EngineState::Closed;
        }
        match self.session.status() {
            Status::Ready => EngineState::Ready {
                bin_size: self.buffers.bin_size(),
            },
            _ => EngineState::Uninitialized,
        }
    }

    /// Devices the backend can see. Does not touch the session.
    pub fn available_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        self.session.backend_mut().enumerate_devices()
    }

    fn is_live(&self) -> bool {
        !self.closed && self.session.is_ready() && self.buffers.is_ready()
    }

    /// Process one block.
    ///
    /// `input` and `output` should have equal length; extra output samples are
    /// zeroed. `sample_rate` is only used to report blocks that miss their
    /// real-time deadline and may be 0.
    pub fn process(&mut self, input: &[f64], output: &mut [f64], sample_rate: f64) {
        let n = input.len().min(output.len());
        output[n..].fill(0.0);
        if n == 0 {
            return;
        }
        let (input, output) = (&input[..n], &mut output[..n]);

        let started = Instant::now();
        self.stats.blocks += 1;
        if self.in_flight {
            warn!("block arrived while the previous dispatch was still in flight");
            self.stats.overruns += 1;
        }

        self.prepare(n);

        if !self.is_live() {
            self.stats.skipped += 1;
            self.config.failure_policy.apply(input, output);
            return;
        }

        self.in_flight = true;
        let result = self.dispatch(input, output);
        self.in_flight = false;

        match result {
            Ok(()) => self.stats.dispatches += 1,
            Err(e) => {
                warn!("dispatch failed, block dropped: {}", e);
                self.stats.dispatch_errors += 1;
                self.config.failure_policy.apply(input, output);
            }
        }

        self.advance_history(input);

        let elapsed = started.elapsed();
        self.stats.record(elapsed);
        trace!("block of {} bins took {:?}", n, elapsed);
        // a budget too large for Duration can never be missed
        if sample_rate > 0.0 {
            if let Ok(budget) = Duration::try_from_secs_f64(n as f64 / sample_rate) {
                if elapsed > budget {
                    warn!("block of {} samples took {:?}, deadline {:?}", n, elapsed, budget);
                    self.stats.deadline_misses += 1;
                }
            }
        }
    }

    /// Lazy initialization and block-size change detection.
    fn prepare(&mut self, bin_size: usize) {
        if self.closed {
            return;
        }
        if !self.attempted {
            self.attempted = true;
            if self.session.initialize().is_ok() {
                self.allocate(bin_size);
            }
            return;
        }
        if !self.session.is_ready() || self.buffers.status() == Status::Failed {
            return;
        }
        if self.buffers.bin_size() != Some(bin_size) {
            debug!(
                "block size changed from {:?} to {}, reallocating device buffers",
                self.buffers.bin_size(),
                bin_size
            );
            self.stats.reallocations += 1;
            self.allocate(bin_size);
        }
    }

    fn allocate(&mut self, bin_size: usize) {
        self.buffers.release();
        if self.ring.bin_size() != bin_size {
            self.ring.resize(bin_size);
        }
        let coefficients = match self.source.coefficients(bin_size, self.config.time_size) {
            Ok(c) => c,
            Err(e) => {
                self.buffers.fail(&e);
                return;
            }
        };
        let Some(mut parts) = self.session.parts() else {
            return;
        };
        // failure is latched and logged by the buffer set
        if self.buffers.allocate(&mut parts, &coefficients, &self.ring).is_ok() {
            self.history_dirty = false;
        }
    }

    fn dispatch(&mut self, input: &[f64], output: &mut [f64]) -> Result<()> {
        let bin_size = input.len();
        let parts = self.session.parts();
        let Some(mut parts) = parts else {
            return Err(GrafError::Latched("session not ready".to_string()));
        };

        if self.history_dirty {
            self.buffers.write_history(&mut parts, &self.ring)?;
            self.history_dirty = false;
        }
        self.buffers.write_input(&mut parts, input)?;
        parts.backend.set_time_offset(parts.kernel, self.ring.offset())?;

        let local = parts.local_size.min(bin_size).max(1);
        let global = padded_global_size(bin_size, local);
        let pending = parts.backend.enqueue(parts.queue, &*parts.kernel, global, local)?;
        parts.backend.wait(parts.queue, pending)?;

        self.buffers.read_output(&mut parts, output)
    }

    /// Advance the ring and store the block just consumed.
    fn advance_history(&mut self, input: &[f64]) {
        let Some(slot) = self.ring.push(input) else {
            return;
        };
        let Some(mut parts) = self.session.parts() else {
            return;
        };
        if let Err(e) = self.buffers.write_history_slot(&mut parts, &self.ring, slot) {
            warn!("history upload failed, full ring resent next block: {}", e);
            self.history_dirty = true;
        }
    }

    /// Seed the history with frames, oldest first, as if they had been
    /// processed. Each frame must be one block long; before the first block
    /// the frames fix the expected block size.
    pub fn prime_history<F: AsRef<[f64]>>(&mut self, frames: &[F]) -> Result<()> {
        let Some(first) = frames.first() else {
            return Ok(());
        };
        let bin_size = first.as_ref().len();
        if let Some(f) = frames.iter().find(|f| f.as_ref().len() != bin_size) {
            return Err(GrafError::Config(format!(
                "history frames must have equal length, got {} and {}",
                bin_size,
                f.as_ref().len()
            )));
        }
        match self.buffers.bin_size() {
            Some(current) if current != bin_size => {
                return Err(GrafError::Config(format!(
                    "history frames have {} bins but the engine runs {}",
                    bin_size, current
                )))
            }
            None if self.ring.bin_size() != bin_size => self.ring.resize(bin_size),
            _ => {}
        }
        for f in frames {
            self.ring.push(f.as_ref());
        }
        self.history_dirty = self.buffers.is_ready();
        Ok(())
    }

    /// Zero the history and rewind the ring. Device state is refreshed on the
    /// next block.
    pub fn clear_history(&mut self) {
        self.ring.reset();
        self.history_dirty = self.buffers.is_ready();
    }

    /// Run a few silent blocks of `bin_size` to bring the device up outside the
    /// real-time path, then clear the history.
    ///
    /// Returns the latched error if initialization failed.
    pub fn warmup(&mut self, bin_size: usize) -> Result<()> {
        let silence = vec![0.0; bin_size];
        let mut out = vec![0.0; bin_size];
        for _ in 0..WARMUP_BLOCKS {
            self.process(&silence, &mut out, 0.0);
        }
        self.clear_history();
        match self.state() {
            EngineState::Failed(msg) => Err(GrafError::Latched(msg)),
            _ => Ok(()),
        }
    }

    /// Release buffers and session. Later blocks make no device calls.
    /// Safe in any state and idempotent.
    pub fn shutdown(&mut self) {
        self.buffers.release();
        self.session.teardown();
        self.closed = self.attempted;
        self.in_flight = false;
    }

    /// Shut down and return to `Uninitialized`, clearing any latched failure
    /// and the history. The next block initializes from scratch.
    pub fn reset(&mut self) {
        self.shutdown();
        self.attempted = false;
        self.closed = false;
        self.history_dirty = false;
        self.ring.reset();
    }
}

impl<B: ComputeBackend> Drop for GrafProcessor<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
