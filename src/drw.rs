//! Damped-random-walk continuum model.
//!
//! The DRW covariance `C_ij = sigma^2 tau exp(-|t_i - t_j|/tau)` plus a
//! diagonal of measurement and systematic variances is rank-1 semiseparable,
//! which gives `ln det C` and `C^-1 v` in O(N) through a (W, D, phi)
//! decomposition. Linear trends (a DC term by default) are marginalised in
//! closed form and re-parameterised through standardised coefficients so the
//! sampler only ever sees well-scaled variables.

use crate::data::LightCurve;
use crate::error::PixonError;
use crate::mcmc::{McmcModel, MhSampler, PosteriorSample, PriorKind};

use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{Array1, Array2};
use std::path::Path;

/// (W, D, phi) decomposition of a DRW covariance over a set of sample times.
///
/// `a1` is the DRW variance `sigma^2 tau`; the diagonal collects the squared
/// measurement errors plus the squared systematic error.
pub struct SemiSeparable {
    w: Array1<f64>,
    d: Array1<f64>,
    phi: Array1<f64>,
    a1: f64,
}

impl SemiSeparable {
    pub fn new(
        time: &Array1<f64>,
        a1: f64,
        inv_tau: f64,
        error: &Array1<f64>,
        syserr: f64,
    ) -> Self {
        let n = time.len();
        let mut w = Array1::zeros(n);
        let mut d = Array1::zeros(n);
        let mut phi = Array1::zeros(n);
        for i in 1..n {
            phi[i] = f64::exp(-inv_tau * (time[i] - time[i - 1]));
        }
        let mut s = 0.0;
        let mut a = error[0] * error[0] + syserr * syserr + a1;
        d[0] = a;
        w[0] = 1.0 / a;
        for i in 1..n {
            s = phi[i] * phi[i] * (s + d[i - 1] * w[i - 1] * w[i - 1]);
            a = error[i] * error[i] + syserr * syserr + a1;
            d[i] = a - a1 * a1 * s;
            w[i] = (1.0 - a1 * s) / d[i];
        }
        Self { w, d, phi, a1 }
    }

    /// The factorisation is valid only while every D entry stays positive.
    pub fn is_positive(&self) -> bool {
        self.d.iter().all(|&d| d > 0.0)
    }

    pub fn lndet(&self) -> f64 {
        self.d.mapv(f64::ln).sum()
    }

    /// `z = C^-1 y` by forward then backward substitution.
    pub fn solve_vec(&self, y: &Array1<f64>) -> Array1<f64> {
        let n = y.len();
        let mut z = y.clone();
        let mut f = 0.0;
        for i in 1..n {
            f = self.phi[i] * (f + self.w[i - 1] * z[i - 1]);
            z[i] = y[i] - self.a1 * f;
        }
        let mut g = 0.0;
        z[n - 1] /= self.d[n - 1];
        for i in (0..n - 1).rev() {
            g = self.phi[i + 1] * (g + z[i + 1]);
            z[i] = z[i] / self.d[i] - self.a1 * self.w[i] * g;
        }
        z
    }

    /// `C^-1 M`, column by column.
    pub fn solve_mat(&self, m: &Array2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(m.raw_dim());
        for (j, col) in m.columns().into_iter().enumerate() {
            let z = self.solve_vec(&col.to_owned());
            out.column_mut(j).assign(&z);
        }
        out
    }
}

/// Solution of the trend-marginalised DRW regression at fixed hyperparameters.
struct TrendFit {
    ss: SemiSeparable,
    /// `C^-1 (y - L q)` with the sampled trend subtracted.
    z: Array1<f64>,
    /// Flux residual `y - L q`.
    yres: Array1<f64>,
    /// Trend coefficients `q = q_hat + chol(C_q) u`.
    q: DVector<f64>,
}

/// DRW continuum model: priors, likelihood, posterior summary and the
/// reconstruction on an extended regular grid.
pub struct ContModel {
    /// Normalised observed continuum.
    pub cont: LightCurve,
    /// Regular reconstruction grid; `recon()` fills flux and error.
    pub recon: LightCurve,
    pub nq: usize,
    pub mean_error: f64,
    ranges: Vec<(f64, f64)>,
    priors: Vec<PriorKind>,
    fixed: Vec<Option<f64>>,
    /// Posterior means, filled by [`ContModel::mcmc`].
    pub best: Array1<f64>,
    pub best_std: Array1<f64>,
}

impl ContModel {
    /// Build the model and its reconstruction grid, extending the observed
    /// baseline by `t_back` and `t_forward` with step `dt`.
    pub fn new(
        cont: LightCurve,
        t_back: f64,
        t_forward: f64,
        dt: f64,
    ) -> Result<Self, PixonError> {
        if !(dt > 0.0) {
            return Err(PixonError::Config("tau_interval must be positive".into()));
        }
        if cont.len() < 3 {
            return Err(PixonError::Config(
                "continuum light curve needs at least three samples".into(),
            ));
        }
        let t0 = cont.time[0] - t_back;
        let t_end = cont.time[cont.len() - 1] + t_forward;
        let n_recon = ((t_end - t0) / dt).ceil() as usize + 1;
        let recon = LightCurve::regular(t0, dt, n_recon);

        let nq = 1;
        let num_params = 3 + nq;
        let mut ranges = vec![
            (0.0, f64::ln(11.0)),
            (f64::ln(1.0e-6), f64::ln(1.0)),
            (0.0, f64::ln(1.0e4)),
        ];
        let mut priors = vec![PriorKind::Uniform; 3];
        let mut fixed: Vec<Option<f64>> = vec![Some(0.0), None, None];
        for _ in 0..nq {
            ranges.push((-5.0, 5.0));
            priors.push(PriorKind::Gaussian {
                mean: 0.0,
                sigma: 1.0,
            });
            fixed.push(None);
        }

        let mean_error = cont.mean_error();
        Ok(Self {
            cont,
            recon,
            nq,
            mean_error,
            ranges,
            priors,
            fixed,
            best: Array1::zeros(num_params),
            best_std: Array1::zeros(num_params),
        })
    }

    /// Unfix the systematic-error scaling (fixed at zero by default).
    pub fn free_systematic_error(&mut self) {
        self.fixed[0] = None;
    }

    fn hyper(&self, params: &[f64]) -> (f64, f64, f64) {
        let syserr = (f64::exp(params[0]) - 1.0) * self.mean_error;
        let tau = f64::exp(params[2]);
        let a1 = f64::exp(2.0 * params[1]) * tau;
        (syserr, a1, tau)
    }

    /// Posterior-mean DRW parameters `(sigma_d, tau_d, syserr)`.
    pub fn drw_params(&self) -> (f64, f64, f64) {
        let tau = f64::exp(self.best[2]);
        let sigma = f64::exp(self.best[1]) * tau.sqrt();
        let syserr = (f64::exp(self.best[0]) - 1.0) * self.mean_error;
        (sigma, tau, syserr)
    }

    fn trend_design(&self, n: usize) -> Array2<f64> {
        Array2::ones((n, self.nq))
    }

    fn fit_trend(&self, params: &[f64]) -> Result<TrendFit, PixonError> {
        let (syserr, a1, tau) = self.hyper(params);
        let ss = SemiSeparable::new(&self.cont.time, a1, 1.0 / tau, &self.cont.error, syserr);
        if !ss.is_positive() {
            return Err(PixonError::NotPositiveDefinite("DRW covariance"));
        }
        let larr = self.trend_design(self.cont.len());

        // Cq^-1 = L^T C^-1 L and L^T C^-1 y.
        let cinv_l = ss.solve_mat(&larr);
        let cq_inv = larr.t().dot(&cinv_l);
        let cinv_y = ss.solve_vec(&self.cont.flux);
        let yq = larr.t().dot(&cinv_y);

        let cq_inv = DMatrix::from_fn(self.nq, self.nq, |i, j| cq_inv[[i, j]]);
        let cq = cq_inv
            .try_inverse()
            .ok_or(PixonError::NotPositiveDefinite("trend covariance C_q"))?;
        let qhat = &cq * DVector::from_fn(self.nq, |i, _| yq[i]);
        let chol = Cholesky::new(cq)
            .ok_or(PixonError::NotPositiveDefinite("trend covariance C_q"))?;
        let u = DVector::from_fn(self.nq, |i, _| params[3 + i]);
        let q = qhat + chol.l() * u;

        let q_nd = Array1::from_iter(q.iter().copied());
        let yres = &self.cont.flux - &larr.dot(&q_nd);
        let z = ss.solve_vec(&yres);
        Ok(TrendFit { ss, z, yres, q })
    }

    /// Reconstruct the continuum at the posterior-mean hyperparameters:
    /// `s_hat = S C^-1 (y - L q)` plus the trend, with diagonal variance
    /// `sigma^2 + syserr^2 - (S C^-1 S^T)_ii`.
    pub fn reconstruct(&mut self) -> Result<(), PixonError> {
        let best = self.best.to_vec();
        let (syserr, a1, tau) = self.hyper(&best);
        let fit = self.fit_trend(&best)?;
        let smat = self.covar_smat(a1, tau);

        let mut flux = smat.dot(&fit.z);
        flux += fit.q[0];
        self.recon.flux.assign(&flux);

        for i in 0..self.recon.len() {
            let srow = smat.row(i).to_owned();
            let zrow = fit.ss.solve_vec(&srow);
            let pe = srow.dot(&zrow);
            self.recon.error[i] = (a1 + syserr * syserr - pe).max(0.0).sqrt();
        }
        self.recon.norm = self.cont.norm;
        Ok(())
    }

    /// Cross covariance between the reconstruction grid and the data times.
    fn covar_smat(&self, a1: f64, tau: f64) -> Array2<f64> {
        let nr = self.recon.len();
        let nd = self.cont.len();
        let mut smat = Array2::zeros((nr, nd));
        for i in 0..nr {
            let t1 = self.recon.time[i];
            for j in 0..nd {
                smat[[i, j]] = a1 * f64::exp(-(t1 - self.cont.time[j]).abs() / tau);
            }
        }
        smat
    }

    /// Conditional mean and lower Cholesky factor of the conditional DRW
    /// covariance on the reconstruction grid, used by the DRW-prior engine to
    /// map standardised deviations onto continuum realisations.
    pub fn conditional(&self) -> Result<(Array1<f64>, DMatrix<f64>), PixonError> {
        let best = self.best.to_vec();
        let (syserr, a1, tau) = self.hyper(&best);
        let fit = self.fit_trend(&best)?;
        let smat = self.covar_smat(a1, tau);

        let mut shat = smat.dot(&fit.z);
        shat += fit.q[0];

        // K_rr - S C^-1 S^T, with the systematic variance on the diagonal
        // and a small jitter so the Cholesky stays stable.
        let nr = self.recon.len();
        let cinv_st = fit.ss.solve_mat(&smat.t().to_owned());
        let reduction = smat.dot(&cinv_st);
        let mut cond = DMatrix::zeros(nr, nr);
        for i in 0..nr {
            for j in 0..nr {
                let k = a1 * f64::exp(-(self.recon.time[i] - self.recon.time[j]).abs() / tau);
                cond[(i, j)] = k - reduction[[i, j]];
            }
            cond[(i, i)] += syserr * syserr + 1.0e-10 * a1;
        }
        let chol = Cholesky::new(cond)
            .ok_or(PixonError::NotPositiveDefinite("conditional DRW covariance"))?;
        Ok((shat, chol.l()))
    }

    /// Sample the posterior, then store its means and standard deviations.
    pub fn mcmc(&mut self, sampler: &MhSampler, path: impl AsRef<Path>) -> Result<(), PixonError> {
        let posterior = sampler.run(self, path.as_ref())?;
        self.load_posterior(&posterior);
        Ok(())
    }

    /// Summarise an already-drawn posterior sample (e.g. read back from disk).
    pub fn load_posterior(&mut self, posterior: &PosteriorSample) {
        self.best = posterior.mean();
        self.best_std = posterior.std();
        for (i, (mean, std)) in self.best.iter().zip(self.best_std.iter()).enumerate() {
            log::info!("best params {i} {mean:.6} +- {std:.6}");
        }
    }
}

impl McmcModel for ContModel {
    fn num_params(&self) -> usize {
        3 + self.nq
    }

    fn param_ranges(&self) -> Vec<(f64, f64)> {
        self.ranges.clone()
    }

    fn param_priors(&self) -> Vec<PriorKind> {
        self.priors.clone()
    }

    fn param_fixed(&self) -> Vec<Option<f64>> {
        self.fixed.clone()
    }

    fn ln_likelihood(&mut self, params: &[f64]) -> f64 {
        match self.fit_trend(params) {
            Ok(fit) => -0.5 * fit.yres.dot(&fit.z) - 0.5 * fit.ss.lndet(),
            Err(_) => f64::NEG_INFINITY,
        }
    }
}
