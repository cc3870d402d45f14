//! Pixon kernel functions and the ordered pixon size table.
//!
//! A pixon is a local smoothing kernel whose width encodes the resolution the
//! data supports at a given pixel. Every kernel variant is normalised to unit
//! mass on a fine grid and exposes its central value through
//! [`PixonKernelTrait::count`], the per-pixel effective-pixon contribution
//! accumulated into the entropy prefactor.

use crate::error::PixonError;

use enum_dispatch::enum_dispatch;
use libm::erf;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const SQRT_2PI: f64 = 2.5066282746310002;

/// Kernel family selector, numeric codes as accepted in configuration files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PixonBasis {
    Parabloid,
    Gaussian,
    ModifiedGaussian,
    Lorentz,
    Wendland,
    Triangle,
    Tophat,
}

impl PixonBasis {
    pub fn from_code(code: u8) -> Result<Self, PixonError> {
        match code {
            0 => Ok(Self::Parabloid),
            1 => Ok(Self::Gaussian),
            2 => Ok(Self::ModifiedGaussian),
            3 => Ok(Self::Lorentz),
            4 => Ok(Self::Wendland),
            5 => Ok(Self::Triangle),
            6 => Ok(Self::Tophat),
            _ => Err(PixonError::Config(format!(
                "pixon_basis_type must be 0..=6, got {code}"
            ))),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Parabloid => 0,
            Self::Gaussian => 1,
            Self::ModifiedGaussian => 2,
            Self::Lorentz => 3,
            Self::Wendland => 4,
            Self::Triangle => 5,
            Self::Tophat => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Parabloid => "parabloid",
            Self::Gaussian => "gaussian",
            Self::ModifiedGaussian => "modified gaussian",
            Self::Lorentz => "lorentz",
            Self::Wendland => "wendland",
            Self::Triangle => "triangle",
            Self::Tophat => "tophat",
        }
    }
}

/// Capability set of a pixon kernel at scale `s`, all distances in pixels.
#[enum_dispatch]
pub trait PixonKernelTrait {
    /// Kernel value at signed pixel offset `d` from the pixon centre.
    fn eval(&self, d: f64, s: f64) -> f64;

    /// Central kernel value, the effective-pixon contribution of one pixel.
    fn count(&self, s: f64) -> f64;

    /// One-sided support radius in pixels; the kernel vanishes beyond it.
    fn support(&self, s: f64) -> f64;
}

/// Inverted parabola truncated at three scale lengths.
#[derive(Clone, Copy, Debug)]
pub struct Parabloid {
    factor: f64,
}

impl PixonKernelTrait for Parabloid {
    fn eval(&self, d: f64, s: f64) -> f64 {
        let a = 3.0 * self.factor * s;
        if d.abs() <= a {
            (1.0 - (d / a).powi(2)) * 0.75 / a
        } else {
            0.0
        }
    }

    fn count(&self, s: f64) -> f64 {
        0.25 / (self.factor * s)
    }

    fn support(&self, s: f64) -> f64 {
        3.0 * self.factor * s
    }
}

/// Gaussian truncated at three standard deviations and renormalised.
#[derive(Clone, Copy, Debug)]
pub struct Gaussian {
    factor: f64,
    erf3: f64,
}

impl PixonKernelTrait for Gaussian {
    fn eval(&self, d: f64, s: f64) -> f64 {
        if d.abs() <= 3.0 * self.factor * s {
            f64::exp(-0.5 * (d / s).powi(2)) / (SQRT_2PI * s * self.erf3)
        } else {
            0.0
        }
    }

    fn count(&self, s: f64) -> f64 {
        1.0 / (SQRT_2PI * s * self.erf3)
    }

    fn support(&self, s: f64) -> f64 {
        3.0 * self.factor * s
    }
}

/// Gaussian with the boundary-clipped constant removed, so the kernel falls
/// to exactly zero at the truncation radius.
#[derive(Clone, Copy, Debug)]
pub struct ModifiedGaussian {
    factor: f64,
    clip: f64,
    norm: f64,
}

impl PixonKernelTrait for ModifiedGaussian {
    fn eval(&self, d: f64, s: f64) -> f64 {
        if d.abs() <= 3.0 * self.factor * s {
            (f64::exp(-0.5 * (d / s).powi(2)) - self.clip) / ((1.0 - self.clip) * s * self.norm)
        } else {
            0.0
        }
    }

    fn count(&self, s: f64) -> f64 {
        1.0 / (s * self.norm)
    }

    fn support(&self, s: f64) -> f64 {
        3.0 * self.factor * s
    }
}

/// Lorentz profile truncated at three scale lengths and renormalised.
#[derive(Clone, Copy, Debug)]
pub struct Lorentz {
    factor: f64,
    atan3: f64,
}

impl PixonKernelTrait for Lorentz {
    fn eval(&self, d: f64, s: f64) -> f64 {
        if d.abs() <= 3.0 * self.factor * s {
            1.0 / (2.0 * s * self.atan3 * (1.0 + (d / s).powi(2)))
        } else {
            0.0
        }
    }

    fn count(&self, s: f64) -> f64 {
        1.0 / (2.0 * s * self.atan3)
    }

    fn support(&self, s: f64) -> f64 {
        3.0 * self.factor * s
    }
}

/// Wendland C² compact radial basis, support one scale length.
#[derive(Clone, Copy, Debug)]
pub struct Wendland {
    factor: f64,
}

impl PixonKernelTrait for Wendland {
    fn eval(&self, d: f64, s: f64) -> f64 {
        let a = self.factor * s;
        let r = d.abs() / a;
        if r <= 1.0 {
            1.5 / a * (1.0 - r).powi(4) * (4.0 * r + 1.0)
        } else {
            0.0
        }
    }

    fn count(&self, s: f64) -> f64 {
        1.5 / (self.factor * s)
    }

    fn support(&self, s: f64) -> f64 {
        self.factor * s
    }
}

/// Triangular kernel, support one scale length.
#[derive(Clone, Copy, Debug)]
pub struct Triangle {
    factor: f64,
}

impl PixonKernelTrait for Triangle {
    fn eval(&self, d: f64, s: f64) -> f64 {
        let a = self.factor * s;
        if d.abs() <= a {
            (1.0 - d.abs() / a) / a
        } else {
            0.0
        }
    }

    fn count(&self, s: f64) -> f64 {
        1.0 / (self.factor * s)
    }

    fn support(&self, s: f64) -> f64 {
        self.factor * s
    }
}

/// Flat kernel over `2s + 1` pixels.
#[derive(Clone, Copy, Debug)]
pub struct Tophat {
    factor: f64,
}

impl PixonKernelTrait for Tophat {
    fn eval(&self, d: f64, s: f64) -> f64 {
        let a = self.factor * s;
        if d.abs() <= a {
            1.0 / (2.0 * a + 1.0)
        } else {
            0.0
        }
    }

    fn count(&self, s: f64) -> f64 {
        1.0 / (2.0 * self.factor * s + 1.0)
    }

    fn support(&self, s: f64) -> f64 {
        self.factor * s
    }
}

/// Pixon kernel dispatched once at engine construction.
#[enum_dispatch(PixonKernelTrait)]
#[derive(Clone, Copy, Debug)]
pub enum PixonKernel {
    Parabloid(Parabloid),
    Gaussian(Gaussian),
    ModifiedGaussian(ModifiedGaussian),
    Lorentz(Lorentz),
    Wendland(Wendland),
    Triangle(Triangle),
    Tophat(Tophat),
}

impl PixonKernel {
    /// Build a kernel with its normalisation constants precomputed.
    ///
    /// `size_factor` stretches every support radius; the default of one
    /// reproduces the tabulated shapes.
    pub fn new(basis: PixonBasis, size_factor: u32) -> Self {
        let factor = size_factor as f64;
        match basis {
            PixonBasis::Parabloid => Parabloid { factor }.into(),
            PixonBasis::Gaussian => Gaussian {
                factor,
                erf3: erf(3.0 * factor / f64::sqrt(2.0)),
            }
            .into(),
            PixonBasis::ModifiedGaussian => {
                let clip = f64::exp(-0.5 * (3.0 * factor).powi(2));
                let norm = (SQRT_2PI * erf(3.0 * factor / f64::sqrt(2.0)) - 6.0 * factor * clip)
                    / (1.0 - clip);
                ModifiedGaussian { factor, clip, norm }.into()
            }
            PixonBasis::Lorentz => Lorentz {
                factor,
                atan3: f64::atan(3.0 * factor),
            }
            .into(),
            PixonBasis::Wendland => Wendland { factor }.into(),
            PixonBasis::Triangle => Triangle { factor }.into(),
            PixonBasis::Tophat => Tophat { factor }.into(),
        }
    }
}

/// Ordered table of pixon scales plus the per-scale pixel occupancy.
///
/// Scales are `s_k = (k + 1) * size_factor / (3 * sub_factor)`; the occupancy
/// counts track how many image pixels currently use each scale, and
/// `ipixon_min` is the smallest occupied index.
#[derive(Clone, Debug)]
pub struct PixonSizes {
    sizes: Vec<f64>,
    counts: Vec<usize>,
    ipixon_min: usize,
}

impl PixonSizes {
    /// All `npixel` pixels start at the largest scale.
    pub fn new(npixon: usize, sub_factor: u32, size_factor: u32, npixel: usize) -> Self {
        assert!(npixon >= 2, "at least two pixon sizes are required");
        let step = size_factor as f64 / (3.0 * sub_factor as f64);
        let sizes = (0..npixon).map(|k| (k + 1) as f64 * step).collect();
        let mut counts = vec![0; npixon];
        counts[npixon - 1] = npixel;
        Self {
            sizes,
            counts,
            ipixon_min: npixon - 1,
        }
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn size(&self, k: usize) -> f64 {
        self.sizes[k]
    }

    pub fn max_size(&self) -> f64 {
        self.sizes[self.sizes.len() - 1]
    }

    pub fn ipixon_min(&self) -> usize {
        self.ipixon_min
    }

    /// Scale indices currently used by at least one pixel, smallest first.
    pub fn active(&self) -> impl Iterator<Item = usize> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(k, _)| k)
    }

    /// Move one pixel from scale `from` to scale `to`.
    pub fn move_pixel(&mut self, from: usize, to: usize) {
        self.counts[from] -= 1;
        self.counts[to] += 1;
        if to < self.ipixon_min {
            self.ipixon_min = to;
        }
    }

    /// Move every pixel from scale `from` to scale `to` (uniform mode).
    pub fn move_all(&mut self, from: usize, to: usize) {
        let n = self.counts[from];
        self.counts[from] = 0;
        self.counts[to] += n;
        self.ipixon_min = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const ALL: [PixonBasis; 7] = [
        PixonBasis::Parabloid,
        PixonBasis::Gaussian,
        PixonBasis::ModifiedGaussian,
        PixonBasis::Lorentz,
        PixonBasis::Wendland,
        PixonBasis::Triangle,
        PixonBasis::Tophat,
    ];

    #[test]
    fn codes_round_trip() {
        for basis in ALL {
            assert_eq!(PixonBasis::from_code(basis.code()).unwrap(), basis);
        }
        assert!(PixonBasis::from_code(7).is_err());
    }

    #[test]
    fn kernels_are_nonnegative_and_symmetric() {
        for basis in ALL {
            let kernel = PixonKernel::new(basis, 1);
            for s in [1.0 / 3.0, 1.0, 4.0] {
                let supp = kernel.support(s);
                let mut d = -supp;
                while d <= supp {
                    let v = kernel.eval(d, s);
                    assert!(v >= 0.0, "{}: negative value at d={d}", basis.name());
                    assert_abs_diff_eq!(v, kernel.eval(-d, s), epsilon = 1e-14);
                    d += supp / 16.0;
                }
                assert_eq!(kernel.eval(supp * 1.01, s), 0.0);
            }
        }
    }

    #[test]
    fn kernel_mass_approaches_unity() {
        // Discrete sums converge to the continuous normalisation for wide
        // pixons; tophat is exactly normalised only at integer scales.
        for basis in ALL {
            let kernel = PixonKernel::new(basis, 1);
            let s = if basis == PixonBasis::Tophat { 6.0 } else { 8.0 };
            let supp = kernel.support(s).ceil() as i64;
            let sum: f64 = (-supp..=supp).map(|d| kernel.eval(d as f64, s)).sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 0.02);
        }
    }

    #[test]
    fn count_is_central_value_and_decreases_with_scale() {
        for basis in ALL {
            let kernel = PixonKernel::new(basis, 1);
            for s in [0.5, 1.0, 2.5] {
                assert_abs_diff_eq!(kernel.count(s), kernel.eval(0.0, s), epsilon = 1e-12);
            }
            assert!(kernel.count(1.0) > kernel.count(2.0));
        }
    }

    #[test]
    fn size_table_follows_convention() {
        let sizes = PixonSizes::new(9, 1, 1, 100);
        assert_abs_diff_eq!(sizes.size(0), 1.0 / 3.0, epsilon = 1e-15);
        assert_abs_diff_eq!(sizes.size(8), 3.0, epsilon = 1e-15);
        assert_eq!(sizes.ipixon_min(), 8);
        assert_eq!(sizes.active().collect::<Vec<_>>(), vec![8]);
    }

    #[test]
    fn occupancy_moves() {
        let mut sizes = PixonSizes::new(4, 1, 1, 10);
        sizes.move_pixel(3, 2);
        assert_eq!(sizes.ipixon_min(), 2);
        assert_eq!(sizes.active().collect::<Vec<_>>(), vec![2, 3]);
        sizes.move_all(3, 2);
        assert_eq!(sizes.active().collect::<Vec<_>>(), vec![2]);
    }
}
