//! Bounded nonlinear minimisation: the oracle contract, a derivative-free
//! COBYLA probe and a projected truncated-Newton refinement.
//!
//! Engines expose their objective through [`Objective`]; the drivers run the
//! probe first to escape the flat start, then refine with the
//! truncated-Newton pass. A non-nominal refinement status makes the caller
//! re-run the probe once before giving up on the outer iteration.

use cobyla::{minimize, Func, RhoBeg, StopTols};
use ordered_float::NotNan;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// Value-and-gradient oracle over a boxed parameter vector.
///
/// `eval_grad` must leave the implementor's internal state consistent with
/// the supplied parameter vector; gradient buffers are caller-allocated.
pub trait Objective {
    fn dim(&self) -> usize;

    /// Objective value only (derivative-free probes).
    fn eval(&mut self, x: &[f64]) -> f64;

    /// Objective value, filling `grad` with the analytic gradient.
    fn eval_grad(&mut self, x: &[f64], grad: &mut [f64]) -> f64;
}

/// Clamp every component of `x` into its box.
pub fn project(x: &mut [f64], lower: &[f64], upper: &[f64]) {
    for ((xi, &lo), &up) in x.iter_mut().zip(lower.iter()).zip(upper.iter()) {
        *xi = xi.clamp(lo, up);
    }
}

/// Derivative-free probe wrapping COBYLA.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct CobylaProbe {
    pub max_eval: usize,
    pub rhobeg: NotNan<f64>,
    pub ftol_abs: NotNan<f64>,
    pub xtol_abs: NotNan<f64>,
}

impl CobylaProbe {
    pub fn new(max_eval: usize, tol: f64) -> Self {
        Self {
            max_eval,
            rhobeg: NotNan::new(0.5).expect("finite constant"),
            ftol_abs: NotNan::new(tol).expect("tolerance must not be NaN"),
            xtol_abs: NotNan::new(tol).expect("tolerance must not be NaN"),
        }
    }

    /// Minimise in place; the probe result is advisory, so a failed status is
    /// reported but never treated as an error.
    pub fn minimize<O: Objective>(
        &self,
        obj: &mut O,
        x: &mut [f64],
        lower: &[f64],
        upper: &[f64],
    ) -> f64 {
        let bounds: Vec<(f64, f64)> = lower
            .iter()
            .zip(upper.iter())
            .map(|(&lo, &up)| (lo, up))
            .collect();
        let cons: Vec<&dyn Func<()>> = vec![];
        let stop_tol = StopTols {
            ftol_abs: self.ftol_abs.into_inner(),
            xtol_abs: vec![self.xtol_abs.into_inner(); x.len()],
            ..StopTols::default()
        };
        let cell = RefCell::new(obj);
        let result = minimize(
            |xs: &[f64], _: &mut ()| cell.borrow_mut().eval(xs),
            x,
            &bounds,
            &cons,
            (),
            self.max_eval,
            RhoBeg::All(self.rhobeg.into_inner()),
            Some(stop_tol),
        );
        match result {
            Ok((_, x_vec, value)) => {
                x.copy_from_slice(&x_vec);
                value
            }
            Err((_, x_vec, value)) => {
                log::debug!("cobyla probe ended without convergence, keeping its iterate");
                x.copy_from_slice(&x_vec);
                value
            }
        }
    }
}

/// Termination reason of [`TruncatedNewton::minimize`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TncStatus {
    /// Projected gradient below tolerance.
    Converged,
    /// Objective fell to the good-fit target `fmin`.
    FminReached,
    FtolReached,
    XtolReached,
    MaxFunEvals,
    LineSearchFailed,
    NotFinite,
}

impl TncStatus {
    /// Nominal codes end an outer iteration normally; the rest trigger the
    /// probe re-run recovery path.
    pub fn is_nominal(self) -> bool {
        !matches!(self, Self::LineSearchFailed | Self::NotFinite)
    }
}

#[derive(Clone, Debug)]
pub struct TncOutcome {
    pub value: f64,
    pub status: TncStatus,
    pub nfeval: usize,
    pub niter: usize,
}

/// Projected truncated-Newton minimiser with box constraints.
///
/// Newton directions are obtained by conjugate gradients restricted to the
/// free variables, with Hessian-vector products taken as forward differences
/// of the analytic gradient; steps are globalised by a projected Armijo
/// backtracking search.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct TruncatedNewton {
    pub max_nfeval: usize,
    /// CG iteration cap; `None` means the problem dimension.
    pub max_cg_iter: Option<usize>,
    /// Good-fit level: iteration stops as soon as the objective reaches it.
    pub fmin: NotNan<f64>,
    pub ftol_abs: NotNan<f64>,
    pub xtol_abs: NotNan<f64>,
    pub pgtol: NotNan<f64>,
}

impl TruncatedNewton {
    pub fn new(max_nfeval: usize, tol: f64, fmin: f64) -> Self {
        Self {
            max_nfeval,
            max_cg_iter: None,
            fmin: NotNan::new(fmin).expect("good-fit target must not be NaN"),
            ftol_abs: NotNan::new(tol).expect("tolerance must not be NaN"),
            xtol_abs: NotNan::new(tol).expect("tolerance must not be NaN"),
            pgtol: NotNan::new(tol).expect("tolerance must not be NaN"),
        }
    }

    pub fn minimize<O: Objective>(
        &self,
        obj: &mut O,
        x: &mut [f64],
        lower: &[f64],
        upper: &[f64],
    ) -> TncOutcome {
        let n = x.len();
        let fmin = self.fmin.into_inner();
        let ftol = self.ftol_abs.into_inner();
        let xtol = self.xtol_abs.into_inner();
        let pgtol = self.pgtol.into_inner();
        let max_cg = self.max_cg_iter.unwrap_or(n).max(1);

        project(x, lower, upper);
        let mut g = vec![0.0; n];
        let mut f = obj.eval_grad(x, &mut g);
        let mut nfeval = 1;
        let mut niter = 0;
        if !f.is_finite() {
            return TncOutcome {
                value: f,
                status: TncStatus::NotFinite,
                nfeval,
                niter,
            };
        }
        if f <= fmin {
            return TncOutcome {
                value: f,
                status: TncStatus::FminReached,
                nfeval,
                niter,
            };
        }

        let mut d = vec![0.0; n];
        let mut r = vec![0.0; n];
        let mut p = vec![0.0; n];
        let mut hp = vec![0.0; n];
        let mut xtrial = vec![0.0; n];
        let mut gtrial = vec![0.0; n];

        loop {
            niter += 1;

            let free: Vec<bool> = (0..n)
                .map(|i| {
                    lower[i] < upper[i]
                        && !(x[i] <= lower[i] && g[i] > 0.0)
                        && !(x[i] >= upper[i] && g[i] < 0.0)
                })
                .collect();
            let pg_norm = (0..n)
                .map(|i| if free[i] { g[i] * g[i] } else { 0.0 })
                .sum::<f64>()
                .sqrt();
            if pg_norm <= pgtol {
                return TncOutcome {
                    value: f,
                    status: TncStatus::Converged,
                    nfeval,
                    niter,
                };
            }
            if nfeval >= self.max_nfeval {
                return TncOutcome {
                    value: f,
                    status: TncStatus::MaxFunEvals,
                    nfeval,
                    niter,
                };
            }

            // Truncated CG on the free subspace.
            d.fill(0.0);
            for i in 0..n {
                r[i] = if free[i] { -g[i] } else { 0.0 };
            }
            p.copy_from_slice(&r);
            let rs0: f64 = r.iter().map(|v| v * v).sum();
            let mut rs_old = rs0;
            let x_norm = x.iter().map(|v| v * v).sum::<f64>().sqrt();
            for cg in 0..max_cg {
                let p_norm = p.iter().map(|v| v * v).sum::<f64>().sqrt();
                if rs_old == 0.0 || p_norm == 0.0 {
                    break;
                }
                let eps = f64::EPSILON.sqrt() * (1.0 + x_norm) / p_norm;
                for i in 0..n {
                    xtrial[i] = x[i] + eps * p[i];
                }
                obj.eval_grad(&xtrial, &mut gtrial);
                nfeval += 1;
                for i in 0..n {
                    hp[i] = if free[i] { (gtrial[i] - g[i]) / eps } else { 0.0 };
                }
                let curv: f64 = p.iter().zip(hp.iter()).map(|(&pi, &hi)| pi * hi).sum();
                if !curv.is_finite() || curv <= 0.0 {
                    // Negative-curvature direction: fall back to the residual
                    // if the very first iteration truncates.
                    if cg == 0 {
                        d.copy_from_slice(&r);
                    }
                    break;
                }
                let alpha = rs_old / curv;
                for i in 0..n {
                    d[i] += alpha * p[i];
                    r[i] -= alpha * hp[i];
                }
                let rs_new: f64 = r.iter().map(|v| v * v).sum();
                if rs_new.sqrt() <= 0.1 * rs0.sqrt() || nfeval >= self.max_nfeval {
                    break;
                }
                let beta = rs_new / rs_old;
                for i in 0..n {
                    p[i] = r[i] + beta * p[i];
                }
                rs_old = rs_new;
            }

            let descent: f64 = d.iter().zip(g.iter()).map(|(&di, &gi)| di * gi).sum();
            if !(descent < 0.0) {
                for i in 0..n {
                    d[i] = if free[i] { -g[i] } else { 0.0 };
                }
            }

            // Projected Armijo backtracking.
            let mut alpha = 1.0;
            let mut accepted = false;
            let mut f_new = f;
            let mut step = 0.0;
            for _ in 0..30 {
                for i in 0..n {
                    xtrial[i] = (x[i] + alpha * d[i]).clamp(lower[i], upper[i]);
                }
                let pred: f64 = (0..n).map(|i| g[i] * (xtrial[i] - x[i])).sum();
                let ft = obj.eval_grad(&xtrial, &mut gtrial);
                nfeval += 1;
                if ft.is_finite() && pred < 0.0 && ft <= f + 1e-4 * pred {
                    step = (0..n).map(|i| (xtrial[i] - x[i]).abs()).fold(0.0, f64::max);
                    f_new = ft;
                    accepted = true;
                    break;
                }
                alpha *= 0.5;
                if nfeval >= self.max_nfeval {
                    break;
                }
            }
            if !accepted {
                // Leave the oracle state consistent with the returned iterate.
                obj.eval_grad(x, &mut g);
                nfeval += 1;
                return TncOutcome {
                    value: f,
                    status: TncStatus::LineSearchFailed,
                    nfeval,
                    niter,
                };
            }

            x.copy_from_slice(&xtrial);
            g.copy_from_slice(&gtrial);
            let df = (f - f_new).abs();
            f = f_new;
            if f <= fmin {
                return TncOutcome {
                    value: f,
                    status: TncStatus::FminReached,
                    nfeval,
                    niter,
                };
            }
            if df <= ftol {
                return TncOutcome {
                    value: f,
                    status: TncStatus::FtolReached,
                    nfeval,
                    niter,
                };
            }
            if step <= xtol {
                return TncOutcome {
                    value: f,
                    status: TncStatus::XtolReached,
                    nfeval,
                    niter,
                };
            }
            if nfeval >= self.max_nfeval {
                return TncOutcome {
                    value: f,
                    status: TncStatus::MaxFunEvals,
                    nfeval,
                    niter,
                };
            }
        }
    }
}

/// One optimisation stage of an outer iteration: probe, refine, and recover
/// from a non-nominal refinement by re-running the probe once.
#[derive(Clone, Debug)]
pub struct Stage {
    pub probe: CobylaProbe,
    pub refine: TruncatedNewton,
}

#[derive(Clone, Copy, Debug)]
pub struct StageOutcome {
    pub value: f64,
    /// False once the refinement failed twice; drivers treat this as loop
    /// termination and keep the previous accepted iterate.
    pub nominal: bool,
}

impl Stage {
    /// `fmin` is the good-fit level passed through to the refinement; use
    /// negative infinity when no early exit is wanted.
    pub fn new(tol: f64, nfeval_max: usize, fmin: f64) -> Self {
        Self {
            probe: CobylaProbe::new(1000, tol),
            refine: TruncatedNewton::new(nfeval_max, tol, fmin),
        }
    }

    pub fn minimize<O: Objective>(
        &self,
        obj: &mut O,
        x: &mut [f64],
        lower: &[f64],
        upper: &[f64],
    ) -> StageOutcome {
        project(x, lower, upper);
        self.probe.minimize(obj, x, lower, upper);
        let mut out = self.refine.minimize(obj, x, lower, upper);
        if !out.status.is_nominal() {
            log::warn!(
                "truncated-Newton refinement returned {:?}, re-running the probe",
                out.status
            );
            self.probe.minimize(obj, x, lower, upper);
            out = self.refine.minimize(obj, x, lower, upper);
            if !out.status.is_nominal() {
                return StageOutcome {
                    value: out.value,
                    nominal: false,
                };
            }
        }
        StageOutcome {
            value: out.value,
            nominal: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Separable quadratic with an off-box minimum in the first coordinate.
    struct Quadratic {
        center: Vec<f64>,
    }

    impl Objective for Quadratic {
        fn dim(&self) -> usize {
            self.center.len()
        }

        fn eval(&mut self, x: &[f64]) -> f64 {
            x.iter()
                .zip(self.center.iter())
                .map(|(&xi, &ci)| (xi - ci).powi(2))
                .sum()
        }

        fn eval_grad(&mut self, x: &[f64], grad: &mut [f64]) -> f64 {
            for ((gi, &xi), &ci) in grad.iter_mut().zip(x.iter()).zip(self.center.iter()) {
                *gi = 2.0 * (xi - ci);
            }
            self.eval(x)
        }
    }

    #[test]
    fn truncated_newton_projects_onto_active_bounds() {
        let mut obj = Quadratic {
            center: vec![3.0, -0.5, 0.2],
        };
        let mut x = vec![0.0, 0.0, 0.0];
        let lower = vec![-1.0, -1.0, -1.0];
        let upper = vec![1.0, 1.0, 1.0];
        let tnc = TruncatedNewton::new(500, 1e-10, f64::NEG_INFINITY);
        let out = tnc.minimize(&mut obj, &mut x, &lower, &upper);
        assert!(out.status.is_nominal());
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(x[1], -0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(x[2], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn cobyla_probe_improves_the_objective() {
        let mut obj = Quadratic {
            center: vec![0.4, -0.3],
        };
        let mut x = vec![0.9, 0.9];
        let f0 = obj.eval(&x);
        let probe = CobylaProbe::new(400, 1e-8);
        let f = probe.minimize(&mut obj, &mut x, &[-1.0, -1.0], &[1.0, 1.0]);
        assert!(f < f0);
        assert_abs_diff_eq!(x[0], 0.4, epsilon = 1e-2);
        assert_abs_diff_eq!(x[1], -0.3, epsilon = 1e-2);
    }

    #[test]
    fn stage_keeps_pinned_coordinates_fixed() {
        let mut obj = Quadratic {
            center: vec![0.4, -0.3, 0.9],
        };
        let mut x = vec![0.0, 0.0, 0.05];
        let lower = vec![-1.0, -1.0, 0.05];
        let upper = vec![1.0, 1.0, 0.05];
        let stage = Stage::new(1e-8, 500, f64::NEG_INFINITY);
        let out = stage.minimize(&mut obj, &mut x, &lower, &upper);
        assert!(out.nominal);
        assert_abs_diff_eq!(x[2], 0.05, epsilon = 0.0);
        assert_abs_diff_eq!(x[0], 0.4, epsilon = 1e-4);
    }

    #[test]
    fn refinement_stops_at_the_good_fit_level() {
        // The minimum value is zero, so a positive target must stop the
        // solver before any of the tolerance criteria fire.
        let mut obj = Quadratic {
            center: vec![0.3, -0.2, 0.1, 0.4],
        };
        let mut x = vec![0.9, 0.9, 0.9, 0.9];
        let lower = vec![-1.0; 4];
        let upper = vec![1.0; 4];
        let tnc = TruncatedNewton::new(500, 1e-12, 0.05);
        let out = tnc.minimize(&mut obj, &mut x, &lower, &upper);
        assert_eq!(out.status, TncStatus::FminReached);
        assert!(out.status.is_nominal());
        assert!(out.value <= 0.05);
    }
}
