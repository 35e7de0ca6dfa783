//! Coefficient tensors and the sources that supply them per block size.

use ndarray::Array3;

use crate::index::coeff_index;
use crate::{GrafError, Result};

/// Flattened `(bin_input, time, bin_output)` weight tensor.
///
/// Total length is `bin_size * time_size * bin_size`; the bin-input axis varies
/// fastest (see [`crate::index::coeff_index`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    data: Vec<f64>,
    bin_size: usize,
    time_size: usize,
}

impl Coefficients {
    /// All-zero tensor.
    pub fn zeros(bin_size: usize, time_size: usize) -> Self {
        Self {
            data: vec![0.0; bin_size * time_size * bin_size],
            bin_size,
            time_size,
        }
    }

    /// Unit weight on `coeff(b, tap, b)` for every bin: output is the input
    /// delayed by `tap` blocks.
    pub fn delay(bin_size: usize, time_size: usize, tap: usize) -> Self {
        let mut c = Self::zeros(bin_size, time_size);
        if tap < time_size {
            for bin in 0..bin_size {
                c.set(bin, tap, bin, 1.0);
            }
        }
        c
    }

    /// Pass-through: unit weight at tap 0 only.
    pub fn identity(bin_size: usize, time_size: usize) -> Self {
        Self::delay(bin_size, time_size, 0)
    }

    /// Per-bin average of the current block and all retained history.
    pub fn moving_average(bin_size: usize, time_size: usize) -> Self {
        let mut c = Self::zeros(bin_size, time_size);
        let w = 1.0 / time_size.max(1) as f64;
        for bin in 0..bin_size {
            for tap in 0..time_size {
                c.set(bin, tap, bin, w);
            }
        }
        c
    }

    /// Wrap a flat tensor, checking its length.
    pub fn from_vec(bin_size: usize, time_size: usize, data: Vec<f64>) -> Result<Self> {
        let expected = bin_size * time_size * bin_size;
        if data.len() != expected {
            return Err(GrafError::Config(format!(
                "coefficient tensor has {} values, expected {} ({}x{}x{})",
                data.len(),
                expected,
                bin_size,
                time_size,
                bin_size
            )));
        }
        Ok(Self {
            data,
            bin_size,
            time_size,
        })
    }

    /// Build from an array shaped `[bin_output, time, bin_input]`.
    ///
    /// Row-major order of that shape is exactly the flat device layout.
    pub fn from_array(array: Array3<f64>) -> Result<Self> {
        let (bin_output, time_size, bin_input) = array.dim();
        if bin_output != bin_input {
            return Err(GrafError::Config(format!(
                "coefficient array must be square in bins, got {} outputs x {} inputs",
                bin_output, bin_input
            )));
        }
        let standard = array.as_standard_layout().into_owned();
        let (data, _offset) = standard.into_raw_vec_and_offset();
        Self::from_vec(bin_input, time_size, data)
    }

    /// View as an array shaped `[bin_output, time, bin_input]`.
    pub fn to_array(&self) -> Result<Array3<f64>> {
        Ok(Array3::from_shape_vec(
            (self.bin_size, self.time_size, self.bin_size),
            self.data.clone(),
        )?)
    }

    pub fn get(&self, bin_input: usize, time: usize, bin_output: usize) -> f64 {
        self.data[coeff_index(bin_input, time, bin_output, self.bin_size, self.time_size)]
    }

    pub fn set(&mut self, bin_input: usize, time: usize, bin_output: usize, value: f64) {
        let i = coeff_index(bin_input, time, bin_output, self.bin_size, self.time_size);
        self.data[i] = value;
    }

    pub fn bin_size(&self) -> usize {
        self.bin_size
    }

    pub fn time_size(&self) -> usize {
        self.time_size
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Supplies the coefficient tensor for a given block geometry.
///
/// Called once per buffer allocation (first block and every block-size change),
/// never per block.
pub trait CoefficientSource: Send {
    fn coefficients(&mut self, bin_size: usize, time_size: usize) -> Result<Coefficients>;
}

/// A fixed tensor only fits the block size it was built for.
impl CoefficientSource for Coefficients {
    fn coefficients(&mut self, bin_size: usize, time_size: usize) -> Result<Coefficients> {
        if self.bin_size != bin_size || self.time_size != time_size {
            return Err(GrafError::Config(format!(
                "coefficient tensor is {}x{}x{} but the engine needs {}x{}x{}",
                self.bin_size, self.time_size, self.bin_size, bin_size, time_size, bin_size
            )));
        }
        Ok(self.clone())
    }
}

/// Built-in tensors that can be generated for any block size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Preset {
    Zeros,
    Identity,
    /// Output the input delayed by this many blocks.
    Delay(usize),
    MovingAverage,
}

impl Preset {
    pub fn build(self, bin_size: usize, time_size: usize) -> Coefficients {
        match self {
            Preset::Zeros => Coefficients::zeros(bin_size, time_size),
            Preset::Identity => Coefficients::identity(bin_size, time_size),
            Preset::Delay(tap) => Coefficients::delay(bin_size, time_size, tap),
            Preset::MovingAverage => Coefficients::moving_average(bin_size, time_size),
        }
    }
}

impl CoefficientSource for Preset {
    fn coefficients(&mut self, bin_size: usize, time_size: usize) -> Result<Coefficients> {
        if let Preset::Delay(tap) = *self {
            if tap >= time_size {
                return Err(GrafError::Config(format!(
                    "delay of {} blocks needs time_size > {}, got {}",
                    tap, tap, time_size
                )));
            }
        }
        Ok(self.build(bin_size, time_size))
    }
}

/// Adapts a closure `(bin_size, time_size) -> Coefficients` into a source.
pub struct FnSource<F>(pub F);

impl<F> CoefficientSource for FnSource<F>
where
    F: FnMut(usize, usize) -> Coefficients + Send,
{
    fn coefficients(&mut self, bin_size: usize, time_size: usize) -> Result<Coefficients> {
        let c = (self.0)(bin_size, time_size);
        // run through the length check so a bad closure fails allocation, not the kernel
        Coefficients::from_vec(bin_size, time_size, c.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_shape() {
        let c = Coefficients::identity(4, 2);
        assert_eq!(c.len(), 32);
        assert_eq!(c.get(2, 0, 2), 1.0);
        assert_eq!(c.get(2, 1, 2), 0.0);
        assert_eq!(c.get(1, 0, 2), 0.0);

        let d = Coefficients::delay(4, 2, 1);
        assert_eq!(d.get(3, 1, 3), 1.0);
        assert_eq!(d.get(3, 0, 3), 0.0);

        let m = Coefficients::moving_average(2, 4);
        assert!((0..4).all(|t| (m.get(1, t, 1) - 0.25).abs() < 1e-12));
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(Coefficients::from_vec(4, 2, vec![0.0; 8]).is_err());
        assert!(Coefficients::from_vec(4, 2, vec![0.0; 32]).is_ok());
    }

    #[test]
    fn test_from_array_layout() {
        let mut a = Array3::<f64>::zeros((3, 2, 3));
        a[[2, 1, 0]] = 7.0; // bin_output 2, tap 1, bin_input 0
        let c = Coefficients::from_array(a.clone()).unwrap();
        assert_eq!(c.get(0, 1, 2), 7.0);
        assert_eq!(c.to_array().unwrap(), a);

        // a transposed view is copied into standard order first
        let reversed = a.reversed_axes();
        let c = Coefficients::from_array(reversed).unwrap();
        assert_eq!(c.get(2, 1, 0), 7.0);
        assert_eq!(c.get(0, 1, 2), 0.0);

        assert!(Coefficients::from_array(Array3::zeros((2, 1, 3))).is_err());
    }

    #[test]
    fn test_fixed_source_checks_geometry() {
        let mut fixed = Coefficients::identity(4, 2);
        assert!(fixed.coefficients(4, 2).is_ok());
        assert!(fixed.coefficients(8, 2).is_err());
    }

    #[test]
    fn test_preset_and_fn_sources() {
        let mut p = Preset::Delay(1);
        assert_eq!(p.coefficients(3, 2).unwrap(), Coefficients::delay(3, 2, 1));
        assert!(p.coefficients(3, 1).is_err());

        let mut f = FnSource(|b: usize, t: usize| Coefficients::moving_average(b, t));
        assert_eq!(f.coefficients(5, 3).unwrap().len(), 75);

        let mut bad = FnSource(|_b: usize, _t: usize| Coefficients::zeros(1, 1));
        assert!(bad.coefficients(5, 3).is_err());
    }
}
