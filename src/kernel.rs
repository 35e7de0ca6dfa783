//! The `system` kernel: source text for accelerator backends and the
//! host-side evaluation used by the CPU backend.

use rayon::prelude::*;

use crate::index::{coeff_index, history_index, history_slots, ring_slot};

/// OpenCL C source compiled at session initialization.
pub const KERNEL_SOURCE: &str = include_str!("kernels/system.cl");

/// Name of the kernel entry point inside [`KERNEL_SOURCE`].
pub const KERNEL_NAME: &str = "system";

// Argument positions of the entry point.
pub const ARG_INPUT: u32 = 0;
pub const ARG_OUTPUT: u32 = 1;
pub const ARG_PAST: u32 = 2;
pub const ARG_COEFFS: u32 = 3;
pub const ARG_BIN_SIZE: u32 = 4;
pub const ARG_TIME_SIZE: u32 = 5;
pub const ARG_TIME_OFFSET: u32 = 6;

/// Borrowed view of everything one evaluation of the kernel reads.
#[derive(Clone, Copy)]
pub struct SystemArgs<'a> {
    pub input: &'a [f64],
    pub past: &'a [f64],
    pub coeffs: &'a [f64],
    pub bin_size: usize,
    pub time_size: usize,
    pub time_offset: usize,
}

impl SystemArgs<'_> {
    /// Output value of a single bin.
    pub fn evaluate_bin(&self, bin_output: usize) -> f64 {
        let slots = history_slots(self.time_size);
        let mut accum = 0.0f64;
        for bin_input in 0..self.bin_size {
            let i = coeff_index(bin_input, 0, bin_output, self.bin_size, self.time_size);
            accum += self.input[bin_input] * self.coeffs[i];
            for time in 0..slots {
                let slot = ring_slot(self.time_offset, time, slots);
                let n = history_index(bin_input, slot, self.bin_size);
                let m = coeff_index(bin_input, time + 1, bin_output, self.bin_size, self.time_size);
                accum += self.past[n] * self.coeffs[m];
            }
        }
        accum
    }

    /// Evaluate every output bin in parallel on the current rayon pool.
    pub fn evaluate(&self, output: &mut [f64]) {
        debug_assert_eq!(output.len(), self.bin_size);
        output
            .par_iter_mut()
            .enumerate()
            .for_each(|(bin_output, out)| *out = self.evaluate_bin(bin_output));
    }
}

/// Scan an OpenCL C source for `__kernel` entry point names.
pub fn entry_points(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find("__kernel") {
        rest = &rest[pos + "__kernel".len()..];
        let Some(open) = rest.find('(') else {
            break;
        };
        if let Some(name) = rest[..open].split_whitespace().last() {
            names.push(name.to_string());
        }
        rest = &rest[open..];
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coefficients::Coefficients;

    fn run(args: SystemArgs<'_>) -> Vec<f64> {
        let mut out = vec![f64::NAN; args.bin_size];
        args.evaluate(&mut out);
        out
    }

    #[test]
    fn test_zero_coefficients_give_silence() {
        let coeffs = Coefficients::zeros(4, 3);
        let out = run(SystemArgs {
            input: &[1.0, -2.0, 3.5, 4.0],
            past: &[9.0; 8],
            coeffs: coeffs.as_slice(),
            bin_size: 4,
            time_size: 3,
            time_offset: 1,
        });
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_identity_ignores_history() {
        let coeffs = Coefficients::identity(4, 2);
        for past in [[0.0; 4], [5.0, 6.0, 7.0, 8.0], [-1.0; 4]] {
            let out = run(SystemArgs {
                input: &[1.0, 2.0, 3.0, 4.0],
                past: &past,
                coeffs: coeffs.as_slice(),
                bin_size: 4,
                time_size: 2,
                time_offset: 0,
            });
            assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        }
    }

    #[test]
    fn test_one_block_delay_reads_history() {
        let coeffs = Coefficients::delay(4, 2, 1);
        let out = run(SystemArgs {
            input: &[1.0, 2.0, 3.0, 4.0],
            past: &[5.0, 6.0, 7.0, 8.0],
            coeffs: coeffs.as_slice(),
            bin_size: 4,
            time_size: 2,
            time_offset: 0,
        });
        assert_eq!(out, vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_taps_follow_time_offset() {
        // 2 bins, 3 taps: ring slots 0 and 1, offset 0 means slot 0 is one block ago
        let mut coeffs = Coefficients::zeros(2, 3);
        coeffs.set(0, 2, 0, 1.0); // two blocks ago, bin 0 -> bin 0
        let past = [10.0, 11.0, 20.0, 21.0];
        let args = |time_offset| SystemArgs {
            input: &[0.0, 0.0],
            past: &past,
            coeffs: coeffs.as_slice(),
            bin_size: 2,
            time_size: 3,
            time_offset,
        };
        assert_eq!(run(args(0))[0], 20.0);
        assert_eq!(run(args(1))[0], 10.0);
    }

    #[test]
    fn test_bins_mix_across_inputs() {
        let mut coeffs = Coefficients::zeros(3, 1);
        coeffs.set(0, 0, 2, 0.5);
        coeffs.set(1, 0, 2, 0.25);
        let out = run(SystemArgs {
            input: &[2.0, 4.0, 100.0],
            past: &[],
            coeffs: coeffs.as_slice(),
            bin_size: 3,
            time_size: 1,
            time_offset: 0,
        });
        assert_eq!(out, vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_source_declares_entry_point() {
        assert_eq!(entry_points(KERNEL_SOURCE), vec![KERNEL_NAME.to_string()]);
        assert!(KERNEL_SOURCE.contains("long warp(long index, long size)"));
    }

    #[test]
    fn test_entry_points_multiple() {
        let src = "__kernel void a(int x) {}\n__kernel  void\n  b (int y) {}";
        assert_eq!(entry_points(src), vec!["a".to_string(), "b".to_string()]);
    }
}
