//! Real-to-complex FFT convolution primitives.
//!
//! Convolutions are circular over the zero-padded length `nfft = nd + npad`;
//! callers guarantee `npad` exceeds the kernel's one-sided support so the
//! interior `nd` samples equal the linear convolution. Plans are created once
//! per convolver and reused for every transform.

use crate::basis::{PixonKernel, PixonKernelTrait, PixonSizes};

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// Padded circular convolver with a cached data spectrum.
pub struct Convolver {
    nd: usize,
    nfft: usize,
    norm: f64,
    r2c: Arc<dyn RealToComplex<f64>>,
    c2r: Arc<dyn ComplexToReal<f64>>,
    real: Vec<f64>,
    back: Vec<f64>,
    data_fft: Vec<Complex<f64>>,
    resp_fft: Vec<Complex<f64>>,
    conv_fft: Vec<Complex<f64>>,
}

impl Convolver {
    /// `dx` is the sampling step of the data axis; the convolution result is
    /// scaled by `dx / nfft` so it approximates the continuous integral.
    pub fn new(nd: usize, dx: f64, npad: usize) -> Self {
        let nfft = nd + npad;
        let mut planner = RealFftPlanner::<f64>::new();
        let r2c = planner.plan_fft_forward(nfft);
        let c2r = planner.plan_fft_inverse(nfft);
        let data_fft = r2c.make_output_vec();
        let resp_fft = r2c.make_output_vec();
        let conv_fft = r2c.make_output_vec();
        Self {
            nd,
            nfft,
            norm: dx / nfft as f64,
            r2c,
            c2r,
            real: vec![0.0; nfft],
            back: vec![0.0; nfft],
            data_fft,
            resp_fft,
            conv_fft,
        }
    }

    pub fn nd(&self) -> usize {
        self.nd
    }

    pub fn nfft(&self) -> usize {
        self.nfft
    }

    fn forward(&mut self, into_data: bool) {
        let spectrum = if into_data {
            &mut self.data_fft
        } else {
            &mut self.resp_fft
        };
        self.r2c
            .process(&mut self.real, spectrum)
            .expect("forward buffer lengths match the plan");
    }

    /// Cache the forward transform of `data` (placed at the buffer start).
    pub fn set_data(&mut self, data: &[f64]) {
        assert!(data.len() <= self.nfft);
        self.real[..data.len()].copy_from_slice(data);
        self.real[data.len()..].fill(0.0);
        self.forward(true);
    }

    /// Transform a causal response placed at the buffer start.
    pub fn set_response(&mut self, resp: &[f64]) {
        assert!(resp.len() <= self.nfft);
        self.real[..resp.len()].copy_from_slice(resp);
        self.real[resp.len()..].fill(0.0);
        self.forward(false);
    }

    /// Transform a kernel symmetric about zero lag: negative offsets are
    /// wrapped to the high end of the padded buffer.
    pub fn set_response_wrapped<K: Fn(f64) -> f64>(&mut self, kernel: K) {
        let half = self.nfft / 2;
        for (j, v) in self.real.iter_mut().enumerate() {
            let d = if j <= half {
                j as f64
            } else {
                j as f64 - self.nfft as f64
            };
            *v = kernel(d);
        }
        self.forward(false);
    }

    /// Multiply the cached spectra, invert and write the first `nd` samples.
    pub fn convolve_into(&mut self, out: &mut [f64]) {
        assert_eq!(out.len(), self.nd);
        for ((c, &d), &r) in self
            .conv_fft
            .iter_mut()
            .zip(self.data_fft.iter())
            .zip(self.resp_fft.iter())
        {
            *c = d * r;
        }
        // Products of two real-signal spectra are exactly real in the DC and
        // Nyquist bins; clear the sign of zero so the inverse plan accepts them.
        self.conv_fft[0].im = 0.0;
        if self.nfft % 2 == 0 {
            let last = self.conv_fft.len() - 1;
            self.conv_fft[last].im = 0.0;
        }
        self.c2r
            .process(&mut self.conv_fft, &mut self.back)
            .expect("inverse buffer lengths match the plan");
        for (o, &b) in out.iter_mut().zip(self.back.iter()) {
            *o = b * self.norm;
        }
    }
}

/// Convolver for the reverberation integral `l = psi (*) c`.
///
/// The driving signal is transformed once (or whenever it changes); each
/// candidate transfer function costs one forward and one inverse transform.
pub struct RmFft {
    conv: Convolver,
}

impl RmFft {
    pub fn new(flux: &[f64], dx: f64, npad: usize) -> Self {
        let mut conv = Convolver::new(flux.len(), dx, npad);
        conv.set_data(flux);
        Self { conv }
    }

    /// Replace the driving signal, re-using the existing plans.
    pub fn set_data(&mut self, flux: &[f64]) {
        self.conv.set_data(flux);
    }

    pub fn convolve(&mut self, resp: &[f64], out: &mut [f64]) {
        self.conv.set_response(resp);
        self.conv.convolve_into(out);
    }
}

/// Convolver that smooths a pseudo-image with per-pixel pixon kernels.
pub struct PixonFft {
    conv: Convolver,
    scratch: Vec<f64>,
}

impl PixonFft {
    pub fn new(npixel: usize, npad: usize) -> Self {
        Self {
            conv: Convolver::new(npixel, 1.0, npad),
            scratch: vec![0.0; npixel],
        }
    }

    /// Smooth with a single kernel scale (uniform pixon map).
    pub fn convolve_uniform(
        &mut self,
        pseudo: &[f64],
        kernel: &PixonKernel,
        size: f64,
        out: &mut [f64],
    ) {
        self.conv.set_data(pseudo);
        self.conv.set_response_wrapped(|d| kernel.eval(d, size));
        self.conv.convolve_into(out);
    }

    /// Smooth with the per-pixel map: one convolution per active scale, then
    /// scatter each result into the pixels assigned to that scale.
    pub fn convolve_map(
        &mut self,
        pseudo: &[f64],
        kernel: &PixonKernel,
        sizes: &PixonSizes,
        map: &[usize],
        out: &mut [f64],
    ) {
        self.conv.set_data(pseudo);
        for k in sizes.active().collect::<Vec<_>>() {
            let size = sizes.size(k);
            self.conv.set_response_wrapped(|d| kernel.eval(d, size));
            self.conv.convolve_into(&mut self.scratch);
            for (j, &m) in map.iter().enumerate() {
                if m == k {
                    out[j] = self.scratch[j];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::PixonBasis;
    use approx::assert_abs_diff_eq;
    use light_curve_common::linspace;

    #[test]
    fn unit_kernel_reproduces_input() {
        let n = 64;
        let x: Vec<f64> = linspace(0.0_f64, 10.0, n)
            .iter()
            .map(|&t| 1.0 + (0.37 * t).sin())
            .collect();
        let mut conv = Convolver::new(n, 1.0, n);
        conv.set_data(&x);
        let mut resp = vec![0.0; n];
        resp[0] = 1.0;
        conv.set_response(&resp);
        let mut out = vec![0.0; n];
        conv.convolve_into(&mut out);
        let scale: f64 = x.iter().map(|v| v * v).sum::<f64>().sqrt();
        for (o, v) in out.iter().zip(x.iter()) {
            assert!((o - v).abs() <= 1e-10 * scale);
        }
    }

    #[test]
    fn delta_kernel_shifts_input() {
        let n = 50;
        let x: Vec<f64> = (0..n).map(|i| (i as f64 * 0.3).cos()).collect();
        let mut conv = Convolver::new(n, 1.0, n);
        conv.set_data(&x);
        let lag = 7;
        let mut resp = vec![0.0; n];
        resp[lag] = 1.0;
        conv.set_response(&resp);
        let mut out = vec![0.0; n];
        conv.convolve_into(&mut out);
        for i in lag..n {
            assert_abs_diff_eq!(out[i], x[i - lag], epsilon = 1e-12);
        }
        for v in &out[..lag] {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn matches_direct_convolution_with_step_scaling() {
        let n = 24;
        let dx = 0.5;
        let data: Vec<f64> = (0..n).map(|i| 1.0 + (i as f64 * 0.7).sin()).collect();
        let resp = [0.2, 0.5, 0.3, 0.1];
        let mut conv = Convolver::new(n, dx, n);
        conv.set_data(&data);
        conv.set_response(&resp);
        let mut out = vec![0.0; n];
        conv.convolve_into(&mut out);
        for i in 0..n {
            let mut direct = 0.0;
            for (j, &r) in resp.iter().enumerate() {
                if i >= j {
                    direct += r * data[i - j];
                }
            }
            assert_abs_diff_eq!(out[i], direct * dx, epsilon = 1e-12);
        }
    }

    #[test]
    fn wrapped_kernel_smooths_symmetrically() {
        let n = 40;
        let mut pseudo = vec![0.0; n];
        pseudo[20] = 1.0;
        let kernel = PixonKernel::new(PixonBasis::Gaussian, 1);
        let sizes = PixonSizes::new(6, 1, 1, n);
        let map = vec![5_usize; n];
        let mut pfft = PixonFft::new(n, 3 * 2 + 1);
        let mut out = vec![0.0; n];
        pfft.convolve_map(&pseudo, &kernel, &sizes, &map, &mut out);
        let s = sizes.size(5);
        for d in 0..5 {
            assert_abs_diff_eq!(out[20 + d], out[20 - d], epsilon = 1e-12);
            assert_abs_diff_eq!(out[20 + d], kernel.eval(d as f64, s), epsilon = 1e-12);
        }
    }

    #[test]
    fn map_scatter_selects_per_pixel_scale() {
        let n = 32;
        let pseudo: Vec<f64> = (0..n).map(|i| 1.0 + 0.1 * (i as f64).sin()).collect();
        let kernel = PixonKernel::new(PixonBasis::Triangle, 1);
        let sizes = PixonSizes::new(6, 1, 1, n);
        let mut map = vec![5_usize; n];
        map[10] = 2;

        let mut pfft = PixonFft::new(n, 7);
        let mut mixed = vec![0.0; n];
        let mut sizes_mixed = sizes.clone();
        sizes_mixed.move_pixel(5, 2);
        pfft.convolve_map(&pseudo, &kernel, &sizes_mixed, &map, &mut mixed);

        let mut small = vec![0.0; n];
        pfft.convolve_uniform(&pseudo, &kernel, sizes.size(2), &mut small);
        let mut large = vec![0.0; n];
        pfft.convolve_uniform(&pseudo, &kernel, sizes.size(5), &mut large);

        assert_abs_diff_eq!(mixed[10], small[10], epsilon = 1e-12);
        assert_abs_diff_eq!(mixed[11], large[11], epsilon = 1e-12);
    }
}
