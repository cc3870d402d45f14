//! DRW-prior continuum engine.
//!
//! The continuum on the regular grid is parameterised by standardised
//! deviations `u` around the posterior-mean DRW reconstruction:
//! `c = s_hat + Q u`, with `Q` the lower Cholesky factor of the conditional
//! DRW covariance. The squared norm of `u` plays the role of the continuum
//! data misfit, so the objective stays `chi^2 + H` with the entropy acting on
//! the transfer function alone.

use crate::basis::{PixonKernel, PixonSizes};
use crate::data::LightCurve;
use crate::optim::Objective;
use crate::pixon::Pixon;

use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

pub struct PixonDrw<'a> {
    pub rm: Pixon<'a>,
    /// Conditional-mean continuum on the grid.
    pub shat: Array1<f64>,
    /// Lower Cholesky factor of the conditional DRW covariance.
    qmat: DMatrix<f64>,
    /// Current standardised deviations.
    pub u: Array1<f64>,
    /// Gradient of the objective with respect to `u`.
    pub grad_chisq_cont: Array1<f64>,
    /// Scratch: gradient of the line misfit with respect to the continuum.
    grad_cont: Array1<f64>,
    pub chisq_cont: f64,
}

impl<'a> PixonDrw<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grid: &'a LightCurve,
        line: &'a LightCurve,
        npixel: usize,
        kernel: PixonKernel,
        sizes: PixonSizes,
        ipositive: i64,
        sensitivity: f64,
        shat: Array1<f64>,
        qmat: DMatrix<f64>,
    ) -> Self {
        let ncont = grid.len();
        assert_eq!(shat.len(), ncont);
        assert_eq!(qmat.nrows(), ncont);
        let rm = Pixon::new(grid, line, npixel, kernel, sizes, ipositive, sensitivity);
        Self {
            rm,
            shat,
            qmat,
            u: Array1::zeros(ncont),
            grad_chisq_cont: Array1::zeros(ncont),
            grad_cont: Array1::zeros(ncont),
            chisq_cont: 0.0,
        }
    }

    pub fn ncont(&self) -> usize {
        self.shat.len()
    }

    /// Map the standardised deviations onto a continuum realisation.
    pub fn compute_cont(&mut self, u: &[f64]) {
        self.u
            .as_slice_mut()
            .expect("contiguous deviation vector")
            .copy_from_slice(u);
        let uv = DVector::from_column_slice(u);
        let qu = &self.qmat * uv;
        for (i, c) in self.rm.cont_flux.iter_mut().enumerate() {
            *c = self.shat[i] + qu[i];
        }
    }

    pub fn compute_rm_pixon(&mut self, x: &[f64]) {
        let npixel = self.rm.npixel;
        self.compute_cont(&x[npixel + 1..]);
        self.rm.refresh_cont_fft();
        self.rm.compute_rm_pixon(x);
    }

    /// The DRW prior turns into a plain Gaussian misfit on `u`.
    pub fn chisquare_cont(&mut self) -> f64 {
        self.chisq_cont = self.u.iter().map(|&v| v * v).sum();
        self.chisq_cont
    }

    pub fn chisquare(&mut self) -> f64 {
        self.rm.chisquare() + self.chisquare_cont()
    }

    pub fn entropy(&mut self) -> f64 {
        self.rm.entropy()
    }

    /// Line-misfit gradient with respect to the continuum samples, scattered
    /// through the interpolation weights of each delayed lookup.
    fn line_grad_cont(&mut self) {
        self.grad_cont.fill(0.0);
        let ncont = self.ncont();
        for k in 0..self.rm.line.len() {
            let coeff =
                2.0 * self.rm.dt * self.rm.residual[k] / self.rm.line.error[k].powi(2);
            let pos_k = self.rm.line_pos[k];
            for j in 0..self.rm.npixel {
                let pos = pos_k - j as f64;
                let m = pos.floor();
                let frac = pos - m;
                let m = m as isize;
                let psi = self.rm.image[j];
                if m >= 0 && (m as usize) < ncont {
                    self.grad_cont[m as usize] += coeff * psi * (1.0 - frac);
                }
                if m + 1 >= 0 && ((m + 1) as usize) < ncont {
                    self.grad_cont[(m + 1) as usize] += coeff * psi * frac;
                }
            }
        }
    }

    /// Chain the continuum gradient through `Q^T` and add the prior term.
    pub fn chisquare_grad(&mut self) {
        self.rm.chisquare_grad();
        self.line_grad_cont();
        let gc = DVector::from_column_slice(
            self.grad_cont.as_slice().expect("contiguous gradient"),
        );
        let gu = self.qmat.transpose() * gc;
        for (i, g) in self.grad_chisq_cont.iter_mut().enumerate() {
            *g = gu[i] + 2.0 * self.u[i];
        }
    }

    pub fn entropy_grad(&mut self) {
        self.rm.entropy_grad();
    }
}

impl Objective for PixonDrw<'_> {
    fn dim(&self) -> usize {
        self.rm.npixel + 1 + self.ncont()
    }

    fn eval(&mut self, x: &[f64]) -> f64 {
        self.compute_rm_pixon(x);
        self.chisquare() + self.entropy()
    }

    fn eval_grad(&mut self, x: &[f64], grad: &mut [f64]) -> f64 {
        self.compute_rm_pixon(x);
        self.chisquare_grad();
        self.entropy_grad();
        let npixel = self.rm.npixel;
        for i in 0..npixel {
            grad[i] = self.rm.grad_chisq[i] + self.rm.grad_mem[i];
        }
        grad[npixel] = self.rm.bg_grad();
        for i in 0..self.ncont() {
            grad[npixel + 1 + i] = self.grad_chisq_cont[i];
        }
        self.chisquare() + self.entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::{PixonBasis, PixonKernel, PixonSizes};
    use crate::tests::{delta_response_line, synth_cont_grid};
    use approx::assert_abs_diff_eq;

    fn fixture<'a>(grid: &'a LightCurve, line: &'a LightCurve, npixel: usize) -> PixonDrw<'a> {
        let ncont = grid.len();
        let kernel = PixonKernel::new(PixonBasis::Gaussian, 1);
        let sizes = PixonSizes::new(6, 1, 1, npixel);
        // A banded, well-conditioned stand-in for the conditional factor.
        let qmat = DMatrix::from_fn(ncont, ncont, |i, j| {
            if i == j {
                0.05
            } else if j < i && i - j <= 2 {
                0.02 / (i - j) as f64
            } else {
                0.0
            }
        });
        PixonDrw::new(
            grid,
            line,
            npixel,
            kernel,
            sizes,
            0,
            1.0,
            grid.flux.clone(),
            qmat,
        )
    }

    #[test]
    fn zero_deviation_reproduces_the_mean_continuum() {
        let grid = synth_cont_grid(60, 1.0);
        let line = delta_response_line(&grid, 16, 5, 0.02, 21);
        let mut engine = fixture(&grid, &line, 16);
        let mut x = vec![f64::ln(1.0 / 16.0); 17];
        x[16] = 0.0;
        x.extend(std::iter::repeat(0.0).take(engine.ncont()));
        engine.compute_rm_pixon(&x);
        for (c, f) in engine.rm.cont_flux.iter().zip(grid.flux.iter()) {
            assert_abs_diff_eq!(c, f, epsilon = 1e-14);
        }
        assert_abs_diff_eq!(engine.chisquare_cont(), 0.0, epsilon = 1e-30);
    }

    #[test]
    fn deviation_gradient_matches_central_differences() {
        let grid = synth_cont_grid(60, 1.0);
        let line = delta_response_line(&grid, 16, 5, 0.02, 22);
        let mut engine = fixture(&grid, &line, 16);
        let npixel = 16;
        let ncont = engine.ncont();

        let mut x = vec![f64::ln(1.0 / 16.0); npixel];
        x.push(0.01);
        x.extend((0..ncont).map(|i| 0.3 * (i as f64 * 0.7).sin()));

        let mut grad = vec![0.0; npixel + 1 + ncont];
        engine.eval_grad(&x, &mut grad);

        let h = 1e-6;
        for i in (3..ncont - 3).step_by(9) {
            let idx = npixel + 1 + i;
            let mut xp = x.clone();
            xp[idx] += h;
            let fp = engine.eval(&xp);
            let mut xm = x.clone();
            xm[idx] -= h;
            let fm = engine.eval(&xm);
            let numeric = (fp - fm) / (2.0 * h);
            let scale = grad[idx].abs().max(1e-2);
            assert!(
                (numeric - grad[idx]).abs() <= 1e-4 * scale,
                "deviation {i}: numeric {numeric} vs analytic {}",
                grad[idx]
            );
        }
    }
}
