//! # graf-rt
//!
//! Real-time block processing with a time-history linear transform evaluated
//! on a parallel compute device.
//!
//! Every block of `bin_size` samples is combined with the previous
//! `time_size - 1` blocks through a fixed coefficient tensor:
//!
//! ```text
//! out[o] = Σ_i in[i] · c(i, 0, o)  +  Σ_t Σ_i past_t[i] · c(i, t + 1, o)
//! ```
//!
//! which generalizes FIR convolution across both the bin and the time-tap
//! dimension. The kernel (`kernels/system.cl`) runs once per block, one work
//! item per output bin.
//!
//! ## Quick Start
//!
//! Use [`GrafStream`] for the simplest API - it handles block buffering:
//!
//! ```ignore
//! use graf_rt::{GrafConfig, GrafStream, Preset};
//!
//! let config = GrafConfig::new(4)?.with_block_size(128);
//! let mut stream = GrafStream::new(config, Preset::MovingAverage)?;
//! stream.warmup()?;
//!
//! let out = stream.process(&samples);
//! let tail = stream.flush();
//! ```
//!
//! ## API Levels
//!
//! - [`GrafStream`] - High-level streaming API. Pass any length of samples,
//!   get processed samples back.
//!
//! - [`GrafProcessor`] - Low-level block API for audio callbacks. The host
//!   hands over one input and one output slice per callback; the block length
//!   may change between callbacks.
//!
//! ## Backends
//!
//! | Backend | Feature | Device |
//! |---------|---------|--------|
//! | [`CpuBackend`] | always | host CPU, rayon thread pool |
//! | `OpenClBackend` | `opencl` | any OpenCL device with `cl_khr_fp64` |
//!
//! ```toml
//! graf-rt = { path = "...", features = ["opencl"] }
//! ```
//!
//! ## Failure Handling
//!
//! Device setup happens lazily on the first block. If any step fails the
//! processor latches a failed state and every later block is filled per the
//! configured [`FailurePolicy`] without touching the device, until
//! [`GrafProcessor::reset`]. A single failed dispatch only affects its own
//! block. [`GrafProcessor::process`] never returns an error.
//!
//! ## Logging
//!
//! This crate uses the `log` crate: device discovery at info level, latched
//! failures at error level, overruns and dropped blocks at warn level, buffer
//! reallocation at debug level and per-block timing at trace level. Install
//! any `log` backend in the host application to see them.
//!
//! ## Thread Safety
//!
//! Each processor instance is independent and `Send`. Create separate
//! instances for parallel processing - they do not share device state.

pub mod backend;
pub mod buffers;
pub mod coefficients;
pub mod config;
pub mod index;
pub mod kernel;
pub mod processor;
pub mod rolling;
pub mod session;
pub mod stream;

use thiserror::Error;

pub use backend::cpu::CpuBackend;
#[cfg(feature = "opencl")]
pub use backend::opencl::OpenClBackend;
pub use backend::{ComputeBackend, DeviceInfo, DeviceKind};
pub use coefficients::{CoefficientSource, Coefficients, FnSource, Preset};
pub use config::{FailurePolicy, GrafConfig, TransferMode};
pub use index::warp;
pub use processor::{DispatchStats, EngineState, GrafProcessor};
pub use rolling::HistoryRing;
pub use stream::GrafStream;

#[derive(Error, Debug)]
pub enum GrafError {
    #[error("Device query error: {0}")]
    DeviceQuery(String),
    #[error("No device at index {index} ({available} available)")]
    NoDevice { index: usize, available: usize },
    #[error("Context creation error: {0}")]
    Context(String),
    #[error("Command queue creation error: {0}")]
    Queue(String),
    #[error("Program build error:\n{log}")]
    ProgramBuild { log: String },
    #[error("Kernel creation error: {0}")]
    KernelCreate(String),
    #[error("Buffer allocation error: {0}")]
    BufferAlloc(String),
    #[error("Kernel argument error: {0}")]
    KernelArg(String),
    #[error("Buffer write error: {0}")]
    Write(String),
    #[error("Buffer read error: {0}")]
    Read(String),
    #[error("Buffer map error: {0}")]
    Map(String),
    #[error("Kernel enqueue error: {0}")]
    Enqueue(String),
    #[error("Completion wait error: {0}")]
    Wait(String),
    #[error("Engine failed earlier: {0}")]
    Latched(String),
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GrafError>;

/// Devices visible to the host backend.
pub fn available_devices() -> Vec<DeviceInfo> {
    CpuBackend::new().enumerate_devices().unwrap_or_default()
}

// Verify that processors can be sent between threads
// This is a compile-time check - if it compiles, the types are Send
fn _assert_send<T: Send>() {}
fn _assert_processor_is_send() {
    _assert_send::<GrafProcessor>();
    _assert_send::<GrafStream>();
    #[cfg(feature = "opencl")]
    _assert_send::<GrafProcessor<OpenClBackend>>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = GrafError::NoDevice { index: 2, available: 1 };
        assert_eq!(e.to_string(), "No device at index 2 (1 available)");
        let e = GrafError::ProgramBuild {
            log: "line 3: error".to_string(),
        };
        assert!(e.to_string().ends_with("line 3: error"));
    }

    #[test]
    fn test_host_device_listed() {
        let devices = available_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].kind, DeviceKind::Cpu);
    }
}
