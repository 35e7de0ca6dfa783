//! High-level streaming API with automatic buffering.

use crate::backend::cpu::CpuBackend;
use crate::backend::ComputeBackend;
use crate::coefficients::CoefficientSource;
use crate::config::GrafConfig;
use crate::processor::GrafProcessor;
use crate::Result;

/// Buffers arbitrary-length input into fixed blocks of `config.block_size`.
///
/// This is the recommended API when the caller does not already work in
/// fixed blocks. Pass any number of samples, get processed samples back.
///
/// ```ignore
/// let config = GrafConfig::new(4)?.with_block_size(256);
/// let mut stream = GrafStream::new(config, Preset::MovingAverage)?;
/// stream.warmup()?;
///
/// // any chunk size; output length is a multiple of the block size
/// let out = stream.process(&chunk);
/// let tail = stream.flush(); // remaining buffered samples at end of stream
/// ```
pub struct GrafStream<B: ComputeBackend = CpuBackend> {
    processor: GrafProcessor<B>,
    block_size: usize,
    sample_rate: f64,
    input_buffer: Vec<f64>,
    block_out: Vec<f64>,
}

impl GrafStream<CpuBackend> {
    pub fn new(config: GrafConfig, source: impl CoefficientSource + 'static) -> Result<Self> {
        Ok(Self::from_processor(GrafProcessor::new(config, source)?))
    }

    /// Stream on the host backend with a fixed worker count.
    ///
    /// - For real-time audio: use 1-2 to minimize latency variance
    /// - For batch/offline: use more for throughput
    pub fn with_threads(config: GrafConfig, source: impl CoefficientSource + 'static, threads: usize) -> Result<Self> {
        Ok(Self::from_processor(GrafProcessor::with_threads(config, source, threads)?))
    }
}

impl<B: ComputeBackend> GrafStream<B> {
    /// Wrap an existing processor; its `config.block_size` fixes the block
    /// length.
    pub fn from_processor(processor: GrafProcessor<B>) -> Self {
        let block_size = processor.config().block_size;
        Self {
            processor,
            block_size,
            sample_rate: 0.0,
            input_buffer: Vec::with_capacity(block_size * 2),
            block_out: vec![0.0; block_size],
        }
    }

    /// Sample rate used for deadline reporting. 0 disables it.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Bring the device up before the first real block.
    pub fn warmup(&mut self) -> Result<()> {
        self.processor.warmup(self.block_size)
    }

    /// Process samples.
    ///
    /// Output may be shorter than input due to internal buffering.
    /// Call [`flush`](Self::flush) at end of stream to get remaining samples.
    pub fn process(&mut self, input: &[f64]) -> Vec<f64> {
        self.input_buffer.extend_from_slice(input);
        let blocks = self.input_buffer.len() / self.block_size;
        let mut output = Vec::with_capacity(blocks * self.block_size);

        for block in self.input_buffer.chunks_exact(self.block_size) {
            self.processor.process(block, &mut self.block_out, self.sample_rate);
            output.extend_from_slice(&self.block_out);
        }
        self.input_buffer.drain(..blocks * self.block_size);
        output
    }

    /// Flush remaining buffered samples.
    ///
    /// Pads with zeros to complete the final block and returns only the
    /// samples that correspond to real input.
    pub fn flush(&mut self) -> Vec<f64> {
        if self.input_buffer.is_empty() {
            return Vec::new();
        }
        let valid_len = self.input_buffer.len();
        self.input_buffer.resize(self.block_size, 0.0);
        self.processor
            .process(&self.input_buffer, &mut self.block_out, self.sample_rate);
        self.input_buffer.clear();
        self.block_out[..valid_len].to_vec()
    }

    /// Reset the processor and drop buffered input.
    ///
    /// Call between separate streams so history from one does not leak into
    /// the next.
    pub fn reset(&mut self) {
        self.processor.reset();
        self.input_buffer.clear();
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Samples waiting for a complete block.
    pub fn pending(&self) -> usize {
        self.input_buffer.len()
    }

    pub fn processor(&self) -> &GrafProcessor<B> {
        &self.processor
    }

    /// Access the underlying processor for advanced use.
    pub fn processor_mut(&mut self) -> &mut GrafProcessor<B> {
        &mut self.processor
    }
}
