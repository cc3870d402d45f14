//! Posterior sampling seam for the continuum hyperparameters.
//!
//! The sampler interface mirrors what a nested-sampling library consumes:
//! parameter count, per-parameter ranges, prior kinds, a fixed-parameter
//! mask, and callbacks for prior draws, perturbations (returning the
//! log-Hastings correction) and the log-likelihood. The bundled
//! [`MhSampler`] is a bounded random-walk Metropolis implementation; any
//! sampler producing the same posterior-sample file can replace it.

use crate::error::PixonError;

use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Prior kind of a single parameter.
#[derive(Clone, Copy, Debug)]
pub enum PriorKind {
    Uniform,
    Gaussian { mean: f64, sigma: f64 },
}

/// Periodic wrap into `[lo, hi)`.
fn wrap(value: f64, lo: f64, hi: f64) -> f64 {
    let width = hi - lo;
    let mut t = (value - lo) % width;
    if t < 0.0 {
        t += width;
    }
    lo + t
}

/// Model interface consumed by a sampler.
pub trait McmcModel {
    fn num_params(&self) -> usize;

    /// Inclusive parameter ranges, one per parameter.
    fn param_ranges(&self) -> Vec<(f64, f64)>;

    fn param_priors(&self) -> Vec<PriorKind>;

    /// `Some(value)` pins a parameter to `value` for the whole run.
    fn param_fixed(&self) -> Vec<Option<f64>>;

    fn ln_likelihood(&mut self, params: &[f64]) -> f64;

    fn draw_from_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let ranges = self.param_ranges();
        let priors = self.param_priors();
        let fixed = self.param_fixed();
        let mut params = Vec::with_capacity(self.num_params());
        for i in 0..self.num_params() {
            let (lo, hi) = ranges[i];
            let value = match priors[i] {
                PriorKind::Uniform => lo + rng.gen::<f64>() * (hi - lo),
                PriorKind::Gaussian { mean, sigma } => {
                    let draw: f64 = rng.sample(StandardNormal);
                    wrap(mean + sigma * draw, lo, hi)
                }
            };
            params.push(fixed[i].unwrap_or(value));
        }
        params
    }

    /// Perturb one free parameter in place; the return value is the
    /// log-Hastings correction including the Gaussian-prior ratio.
    fn perturb<R: Rng + ?Sized>(&self, params: &mut [f64], rng: &mut R) -> f64 {
        let ranges = self.param_ranges();
        let priors = self.param_priors();
        let fixed = self.param_fixed();
        let which = loop {
            let which = rng.gen_range(0..self.num_params());
            if fixed[which].is_none() {
                break which;
            }
        };
        let (lo, hi) = ranges[which];
        let width = hi - lo;
        // Heavy-tailed step scale, as diffusive nested samplers use.
        let scale = f64::powf(10.0, 1.5 - 6.0 * rng.gen::<f64>());
        let step: f64 = rng.sample::<f64, _>(StandardNormal) * scale * width;
        let mut logh = 0.0;
        if let PriorKind::Gaussian { mean, sigma } = priors[which] {
            logh += 0.5 * ((params[which] - mean) / sigma).powi(2);
        }
        params[which] = wrap(params[which] + step, lo, hi);
        if let PriorKind::Gaussian { mean, sigma } = priors[which] {
            logh -= 0.5 * ((params[which] - mean) / sigma).powi(2);
        }
        logh
    }

    /// Append one posterior sample row.
    fn print_particle(&self, out: &mut dyn Write, params: &[f64]) -> std::io::Result<()> {
        for p in params {
            write!(out, "{p:.10e} ")?;
        }
        writeln!(out)
    }
}

/// Posterior sample matrix, one row per retained draw.
#[derive(Clone, Debug)]
pub struct PosteriorSample {
    pub samples: Array2<f64>,
}

impl PosteriorSample {
    pub fn len(&self) -> usize {
        self.samples.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.nrows() == 0
    }

    pub fn mean(&self) -> Array1<f64> {
        self.samples.sum_axis(Axis(0)) / self.len() as f64
    }

    pub fn std(&self) -> Array1<f64> {
        let n = self.len();
        let mean = self.mean();
        let mut acc = Array1::<f64>::zeros(self.samples.ncols());
        for row in self.samples.rows() {
            acc += &(&row - &mean).mapv(|d| d * d);
        }
        if n > 1 {
            (acc / (n - 1) as f64).mapv(f64::sqrt)
        } else {
            acc.mapv(|_| 0.0)
        }
    }

    /// Read a `# N`-headed whitespace-separated sample file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, PixonError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| PixonError::Io {
            path: path.into(),
            source,
        })?;
        let mut lines = content.lines();
        let header = lines.next().unwrap_or("");
        let count: usize = header
            .strip_prefix('#')
            .and_then(|rest| rest.trim().split_whitespace().next())
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| PixonError::PosteriorSample {
                path: path.into(),
                message: "first line must be `# N` with the sample count".into(),
            })?;

        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(count);
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: Result<Vec<f64>, _> = line.split_whitespace().map(str::parse).collect();
            rows.push(row.map_err(|_| PixonError::PosteriorSample {
                path: path.into(),
                message: format!("malformed sample row {}", rows.len() + 2),
            })?);
        }
        if rows.len() != count {
            return Err(PixonError::PosteriorSample {
                path: path.into(),
                message: format!("header promises {count} samples, file has {}", rows.len()),
            });
        }
        let ncols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != ncols) || ncols == 0 {
            return Err(PixonError::PosteriorSample {
                path: path.into(),
                message: "inconsistent column counts".into(),
            });
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let samples = Array2::from_shape_vec((count, ncols), flat)
            .map_err(|err| PixonError::PosteriorSample {
                path: path.into(),
                message: err.to_string(),
            })?;
        Ok(Self { samples })
    }
}

/// Bounded random-walk Metropolis sampler.
#[derive(Clone, Debug)]
pub struct MhSampler {
    pub num_steps: usize,
    pub num_burn: usize,
    pub thin: usize,
    pub seed: u64,
}

impl Default for MhSampler {
    fn default() -> Self {
        Self {
            num_steps: 20000,
            num_burn: 5000,
            thin: 5,
            seed: 42,
        }
    }
}

impl MhSampler {
    /// Sample the model posterior and write the sample file at `path`.
    pub fn run<M: McmcModel>(
        &self,
        model: &mut M,
        path: impl AsRef<Path>,
    ) -> Result<PosteriorSample, PixonError> {
        let path = path.as_ref();
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut params = model.draw_from_prior(&mut rng);
        let mut lnl = model.ln_likelihood(&params);
        let mut tries = 0;
        while !lnl.is_finite() {
            tries += 1;
            if tries > 100 {
                return Err(PixonError::NonFinite("initial log-likelihood"));
            }
            params = model.draw_from_prior(&mut rng);
            lnl = model.ln_likelihood(&params);
        }

        let mut rows: Vec<f64> = Vec::new();
        let mut nrows = 0;
        let mut accepted = 0_usize;
        for step in 0..self.num_steps {
            let mut cand = params.clone();
            let logh = model.perturb(&mut cand, &mut rng);
            let lnl_cand = model.ln_likelihood(&cand);
            if lnl_cand.is_finite() {
                let ln_u = rng.gen::<f64>().max(f64::MIN_POSITIVE).ln();
                if ln_u < lnl_cand - lnl + logh {
                    params = cand;
                    lnl = lnl_cand;
                    accepted += 1;
                }
            }
            if step >= self.num_burn && (step - self.num_burn) % self.thin == 0 {
                rows.extend_from_slice(&params);
                nrows += 1;
            }
        }
        log::info!(
            "mcmc: {} steps, acceptance {:.3}, {} posterior samples",
            self.num_steps,
            accepted as f64 / self.num_steps as f64,
            nrows
        );

        let samples = Array2::from_shape_vec((nrows, model.num_params()), rows)
            .expect("row-major sample buffer matches its shape");
        let posterior = PosteriorSample { samples };

        let file = File::create(path).map_err(|source| PixonError::Io {
            path: path.into(),
            source,
        })?;
        let mut out = BufWriter::new(file);
        let io_err = |source: std::io::Error| PixonError::Io {
            path: path.into(),
            source,
        };
        writeln!(out, "# {nrows}").map_err(io_err)?;
        for row in posterior.samples.rows() {
            model
                .print_particle(&mut out, row.as_slice().expect("contiguous row"))
                .map_err(io_err)?;
        }
        Ok(posterior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Standard normal target with one pinned parameter.
    struct ToyModel;

    impl McmcModel for ToyModel {
        fn num_params(&self) -> usize {
            2
        }

        fn param_ranges(&self) -> Vec<(f64, f64)> {
            vec![(-10.0, 10.0), (-10.0, 10.0)]
        }

        fn param_priors(&self) -> Vec<PriorKind> {
            vec![PriorKind::Uniform, PriorKind::Uniform]
        }

        fn param_fixed(&self) -> Vec<Option<f64>> {
            vec![None, Some(1.5)]
        }

        fn ln_likelihood(&mut self, params: &[f64]) -> f64 {
            -0.5 * params[0].powi(2)
        }
    }

    #[test]
    fn sampler_targets_the_likelihood_and_respects_the_mask() {
        let dir = std::env::temp_dir().join("pixon_rm_mcmc_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("posterior_sample.txt");

        let sampler = MhSampler {
            num_steps: 40000,
            num_burn: 10000,
            thin: 5,
            seed: 7,
        };
        let posterior = sampler.run(&mut ToyModel, &path).unwrap();
        let mean = posterior.mean();
        let std = posterior.std();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 0.2);
        assert_abs_diff_eq!(std[0], 1.0, epsilon = 0.25);
        assert_abs_diff_eq!(mean[1], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(std[1], 0.0, epsilon = 1e-12);

        let reread = PosteriorSample::read(&path).unwrap();
        assert_eq!(reread.len(), posterior.len());
        assert_abs_diff_eq!(reread.mean()[0], mean[0], epsilon = 1e-8);
    }

    #[test]
    fn read_rejects_missing_header() {
        let dir = std::env::temp_dir().join("pixon_rm_mcmc_test_bad");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.txt");
        fs::write(&path, "1.0 2.0\n").unwrap();
        assert!(matches!(
            PosteriorSample::read(&path),
            Err(PixonError::PosteriorSample { .. })
        ));
    }

    #[test]
    fn wrap_stays_in_range() {
        for &v in &[-25.0, -3.0, 0.0, 4.0, 17.0] {
            let w = wrap(v, -5.0, 5.0);
            assert!((-5.0..5.0).contains(&w));
        }
        assert_abs_diff_eq!(wrap(6.0, -5.0, 5.0), -4.0, epsilon = 1e-12);
    }
}
