//! Driver loops: optimise, shrink the pixon map, re-optimise, and write the
//! fixed-name result files.
//!
//! Three continuum treatments (coupled pixon, DRW prior, fixed DRW
//! reconstruction), each in adaptive or uniform pixon-map flavour. Every
//! outer iteration logs the objective, the effective pixon count and chi^2.

use crate::basis::{PixonKernel, PixonSizes};
use crate::config::{
    Config, DRV_MODEL_ALL, DRV_MODEL_CONT_FIX, DRV_MODEL_CONT_PIXON, DRV_MODEL_DRW,
};
use crate::data::LightCurve;
use crate::drw::ContModel;
use crate::error::PixonError;
use crate::mcmc::MhSampler;
use crate::optim::{Objective, Stage};
use crate::pixon::Pixon;
use crate::pixon_cont::{ContWarmup, PixonCont};
use crate::pixon_drw::PixonDrw;

use ndarray::Array1;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Number of pixon sizes the continuum warm-up starts from.
const NPIXON_CONT: usize = 10;

/// Driver-facing surface shared by the three engines.
trait RmObjective: Objective {
    fn compute_rm_pixon(&mut self, x: &[f64]);
    fn chisquare(&mut self) -> f64;
    fn pixon_number(&self) -> f64;
    fn update_pixon_map(&mut self) -> bool;
    fn reduce_pixon_map_all(&mut self);
    fn increase_pixon_map_all(&mut self);
    fn ipixon_min(&self) -> usize;
    fn pixon_size(&self, k: usize) -> f64;
}

impl RmObjective for Pixon<'_> {
    fn compute_rm_pixon(&mut self, x: &[f64]) {
        Pixon::compute_rm_pixon(self, x);
    }
    fn chisquare(&mut self) -> f64 {
        Pixon::chisquare(self)
    }
    fn pixon_number(&self) -> f64 {
        Pixon::pixon_number(self)
    }
    fn update_pixon_map(&mut self) -> bool {
        Pixon::update_pixon_map(self)
    }
    fn reduce_pixon_map_all(&mut self) {
        Pixon::reduce_pixon_map_all(self);
    }
    fn increase_pixon_map_all(&mut self) {
        Pixon::increase_pixon_map_all(self);
    }
    fn ipixon_min(&self) -> usize {
        self.sizes.ipixon_min()
    }
    fn pixon_size(&self, k: usize) -> f64 {
        self.sizes.size(k)
    }
}

impl RmObjective for PixonCont<'_> {
    fn compute_rm_pixon(&mut self, x: &[f64]) {
        PixonCont::compute_rm_pixon(self, x);
    }
    fn chisquare(&mut self) -> f64 {
        PixonCont::chisquare(self)
    }
    fn pixon_number(&self) -> f64 {
        self.rm.pixon_number()
    }
    fn update_pixon_map(&mut self) -> bool {
        self.rm.update_pixon_map()
    }
    fn reduce_pixon_map_all(&mut self) {
        self.rm.reduce_pixon_map_all();
    }
    fn increase_pixon_map_all(&mut self) {
        self.rm.increase_pixon_map_all();
    }
    fn ipixon_min(&self) -> usize {
        self.rm.sizes.ipixon_min()
    }
    fn pixon_size(&self, k: usize) -> f64 {
        self.rm.sizes.size(k)
    }
}

impl RmObjective for PixonDrw<'_> {
    fn compute_rm_pixon(&mut self, x: &[f64]) {
        PixonDrw::compute_rm_pixon(self, x);
    }
    fn chisquare(&mut self) -> f64 {
        PixonDrw::chisquare(self)
    }
    fn pixon_number(&self) -> f64 {
        self.rm.pixon_number()
    }
    fn update_pixon_map(&mut self) -> bool {
        self.rm.update_pixon_map()
    }
    fn reduce_pixon_map_all(&mut self) {
        self.rm.reduce_pixon_map_all();
    }
    fn increase_pixon_map_all(&mut self) {
        self.rm.increase_pixon_map_all();
    }
    fn ipixon_min(&self) -> usize {
        self.rm.sizes.ipixon_min()
    }
    fn pixon_size(&self, k: usize) -> f64 {
        self.rm.sizes.size(k)
    }
}

/// Bounds and flat start for the transfer-function block plus background.
fn response_bounds(npixel: usize, dt: f64, cfg: &Config) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let mut low = vec![-100.0; npixel];
    let mut up = vec![10.0; npixel];
    let mut x = vec![f64::ln(1.0 / (npixel as f64 * dt)); npixel];
    if cfg.fix_bg {
        low.push(cfg.bg);
        up.push(cfg.bg);
        x.push(cfg.bg);
    } else {
        low.push(-1.0);
        up.push(1.0);
        x.push(0.0);
    }
    (low, up, x)
}

/// Bounds around the DRW reconstruction: a +-5 sigma band, floored at zero.
fn cont_bounds(recon: &LightCurve) -> (Vec<f64>, Vec<f64>) {
    let low = recon
        .flux
        .iter()
        .zip(recon.error.iter())
        .map(|(&f, &e)| (f - 5.0 * e).max(0.0))
        .collect();
    let up = recon
        .flux
        .iter()
        .zip(recon.error.iter())
        .map(|(&f, &e)| f + 5.0 * e)
        .collect();
    (low, up)
}

/// First optimisation of an outer loop; logs the starting triple.
fn initial_stage<E: RmObjective>(
    engine: &mut E,
    stage: &Stage,
    x: &mut [f64],
    low: &[f64],
    up: &[f64],
) -> f64 {
    let out = stage.minimize(engine, x, low, up);
    engine.compute_rm_pixon(x);
    let chisq = engine.chisquare();
    log::info!(
        "{:.6}  {:.3}  {:.6}",
        out.value,
        engine.pixon_number(),
        chisq
    );
    out.value
}

/// Adaptive outer loop: shrink the map per pixel, re-optimise, stop when the
/// shrink test fails, the floor is reached, the fit is good enough, or the
/// optimizer fails twice in a row.
fn adaptive_outer<E: RmObjective>(
    engine: &mut E,
    stage: &Stage,
    x: &mut [f64],
    x_old: &mut [f64],
    low: &[f64],
    up: &[f64],
    fmin: f64,
    low_bound: usize,
) {
    let mut iter = 0;
    loop {
        iter += 1;
        log::info!("=================== iter {iter} ===================");
        if !engine.update_pixon_map() {
            break;
        }
        let num = engine.pixon_number();
        let out = stage.minimize(engine, x, low, up);
        if !out.nominal {
            log::warn!("optimizer failed twice, stopping the outer loop");
            break;
        }
        engine.compute_rm_pixon(x);
        let chisq = engine.chisquare();
        log::info!("{:.6}  {num:.3}  {chisq:.6}", out.value);
        x_old.copy_from_slice(x);
        if out.value <= fmin {
            break;
        }
        if engine.ipixon_min() < low_bound {
            break;
        }
    }
}

/// Uniform outer loop: decrement the single pixon size, re-optimise and keep
/// the step only while the MDL acceptance test passes; otherwise roll the map
/// back and stop.
#[allow(clippy::too_many_arguments)]
fn uniform_outer<E: RmObjective>(
    engine: &mut E,
    stage: &Stage,
    x: &mut [f64],
    x_old: &mut [f64],
    low: &[f64],
    up: &[f64],
    fmin: f64,
    low_bound: usize,
    mut npixon_size: usize,
    sensitivity: f64,
    f_init: f64,
) {
    let mut f_old = f_init;
    let mut num_old = engine.pixon_number();
    let mut iter = 0;
    while npixon_size > low_bound + 1 {
        iter += 1;
        log::info!("=================== iter {iter} ===================");
        npixon_size -= 1;
        log::info!(
            "npixon_size: {npixon_size},  size: {:.4}",
            engine.pixon_size(npixon_size - 1)
        );
        engine.reduce_pixon_map_all();
        let num = engine.pixon_number();
        let out = stage.minimize(engine, x, low, up);
        if !out.nominal {
            log::warn!("optimizer failed twice, stopping the outer loop");
            break;
        }
        engine.compute_rm_pixon(x);
        let chisq = engine.chisquare();
        log::info!("{:.6}  {num:.3}  {chisq:.6}", out.value);
        if out.value <= fmin {
            x_old.copy_from_slice(x);
            break;
        }
        let df = out.value - f_old;
        let dnum = num - num_old;
        if -df < dnum * (1.0 + sensitivity / (2.0 * num).sqrt()) {
            // The step does not pay for its extra effective pixels.
            engine.increase_pixon_map_all();
            break;
        }
        num_old = num;
        f_old = out.value;
        x_old.copy_from_slice(x);
    }
}

fn create_output(dir: &Path, name: &str) -> Result<BufWriter<File>, PixonError> {
    let path = dir.join(name);
    let file = File::create(&path).map_err(|source| PixonError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(BufWriter::new(file))
}

fn io_err<'a>(dir: &'a Path, name: &'a str) -> impl Fn(std::io::Error) -> PixonError + 'a {
    move |source| PixonError::Io {
        path: dir.join(name),
        source,
    }
}

/// Write the response, modelled line, full-grid line, continuum and
/// pixon-map files for one finished mode.
fn write_outputs(
    cfg: &Config,
    mode: &str,
    pixon: &Pixon<'_>,
    x_old: &[f64],
    cont_flux: &Array1<f64>,
    cont_err: Option<&Array1<f64>>,
) -> Result<(), PixonError> {
    let dir = cfg.output_dir.as_path();
    let code = cfg.pixon_basis_type;
    log::info!("bg: {}", x_old[pixon.npixel]);

    let name = format!("resp_{mode}.txt_{code}");
    let mut out = create_output(dir, &name)?;
    for i in 0..pixon.npixel {
        writeln!(
            out,
            "{}  {}  {}",
            pixon.tau(i),
            pixon.image[i],
            x_old[i].exp()
        )
        .map_err(io_err(dir, &name))?;
    }

    let name = format!("line_{mode}.txt_{code}");
    let mut out = create_output(dir, &name)?;
    for k in 0..pixon.line.len() {
        writeln!(
            out,
            "{}  {}  {}",
            pixon.line.time[k],
            pixon.itline[k] * pixon.line.norm,
            pixon.residual[k]
        )
        .map_err(io_err(dir, &name))?;
    }

    let name = format!("line_{mode}_full.txt_{code}");
    let mut out = create_output(dir, &name)?;
    for i in 0..pixon.grid.len() {
        writeln!(
            out,
            "{}  {}",
            pixon.grid.time[i],
            pixon.rmline[i] * pixon.line.norm
        )
        .map_err(io_err(dir, &name))?;
    }

    let name = format!("cont_{mode}.txt_{code}");
    let mut out = create_output(dir, &name)?;
    for i in 0..pixon.grid.len() {
        match cont_err {
            Some(err) => writeln!(
                out,
                "{} {}  {}",
                pixon.grid.time[i],
                cont_flux[i] * pixon.grid.norm,
                err[i] * pixon.grid.norm
            ),
            None => writeln!(
                out,
                "{} {}",
                pixon.grid.time[i],
                cont_flux[i] * pixon.grid.norm
            ),
        }
        .map_err(io_err(dir, &name))?;
    }

    let name = format!("pixon_map_{mode}.txt_{code}");
    let mut out = create_output(dir, &name)?;
    for i in 0..pixon.npixel {
        writeln!(
            out,
            "{}  {}",
            pixon.tau(i),
            pixon.sizes.size(pixon.pixon_map[i])
        )
        .map_err(io_err(dir, &name))?;
    }
    Ok(())
}

/// Geometry shared by every mode: pixel count, zero-lag index, kernel and
/// the freshly built size table.
struct ModeSetup {
    npixel: usize,
    ipositive: i64,
    kernel: PixonKernel,
}

impl ModeSetup {
    fn new(cfg: &Config, recon: &LightCurve) -> Result<Self, PixonError> {
        let dt = recon.time[1] - recon.time[0];
        let npixel = ((cfg.tau_range_up - cfg.tau_range_low) / dt) as usize;
        if npixel < 2 || npixel > recon.len() {
            return Err(PixonError::Config(format!(
                "delay range yields {npixel} pixels, expected 2..={}",
                recon.len()
            )));
        }
        let ipositive = ((0.0 - cfg.tau_range_low) / dt).round() as i64;
        Ok(Self {
            npixel,
            ipositive,
            kernel: PixonKernel::new(cfg.basis()?, cfg.pixon_size_factor),
        })
    }

    fn sizes(&self, cfg: &Config) -> PixonSizes {
        PixonSizes::new(
            cfg.npixon(),
            cfg.effective_sub_factor(),
            cfg.pixon_size_factor,
            self.npixel,
        )
    }
}

/// Continuum-only warm-up of the coupled engine: optimise the continuum
/// pseudo-image at the largest continuum pixon, then keep shrinking it while
/// the acceptance test passes. Leaves the accepted smoothed continuum in
/// `engine.image_cont`.
fn continuum_warmup(engine: &mut PixonCont<'_>, stage: &Stage, recon: &LightCurve) {
    let (low, up) = cont_bounds(recon);
    let mut x: Vec<f64> = recon.flux.to_vec();
    let mut x_old = x.clone();
    let fmin = engine.cont_data.len() as f64;

    let mut warm = ContWarmup(engine);
    let out = stage.minimize(&mut warm, &mut x, &low, &up);
    warm.0.compute_cont(&x);
    let mut f_old = out.value;
    let mut num_old = warm.0.pixon_number_cont();
    let chisq = warm.0.chisquare_cont();
    log::info!("{f_old:.6}  {num_old:.3}  {chisq:.6}");
    x_old.copy_from_slice(&x);

    let mut npixon_cont = warm.0.cont_sizes.len();
    while npixon_cont > 2 {
        npixon_cont -= 1;
        log::info!(
            "npixon_size_cont: {npixon_cont},  size: {:.4}",
            warm.0.cont_sizes.size(npixon_cont - 1)
        );
        warm.0.reduce_ipixon_cont();
        let num = warm.0.pixon_number_cont();
        let out = stage.minimize(&mut warm, &mut x, &low, &up);
        if !out.nominal {
            log::warn!("optimizer failed twice, stopping the continuum warm-up");
            break;
        }
        warm.0.compute_cont(&x);
        let chisq = warm.0.chisquare_cont();
        log::info!("{:.6}  {num:.3}  {chisq:.6}", out.value);
        if out.value <= fmin {
            x_old.copy_from_slice(&x);
            break;
        }
        let df = out.value - f_old;
        let dnum = num - num_old;
        if -df < dnum * (1.0 + 1.0 / (2.0 * num).sqrt()) {
            warm.0.increase_ipixon_cont();
            break;
        }
        num_old = num;
        f_old = out.value;
        x_old.copy_from_slice(&x);
    }

    warm.0.compute_cont(&x_old);
}

/// Coupled continuum-pixon mode.
fn run_pixon(
    cont_data: &LightCurve,
    recon: &LightCurve,
    line: &LightCurve,
    cfg: &Config,
    setup: &ModeSetup,
) -> Result<(), PixonError> {
    let uniform = cfg.pixon_uniform;
    let mode = if uniform { "pixon_uniform" } else { "pixon" };
    log::info!("************************************************************");
    log::info!("start run_{mode}, npixon_size: {}", cfg.npixon());

    let mut engine = PixonCont::new(
        recon,
        line,
        cont_data,
        setup.npixel,
        setup.kernel,
        setup.sizes(cfg),
        NPIXON_CONT,
        setup.ipositive,
        cfg.sensitivity,
    );
    let warm_stage = Stage::new(cfg.tol, cfg.nfeval_max, cont_data.len() as f64);

    continuum_warmup(&mut engine, &warm_stage, recon);

    let name = if uniform {
        "cont_recon_pixon_uniform.txt".to_string()
    } else {
        "cont_recon_pixon.txt".to_string()
    };
    let mut out = create_output(&cfg.output_dir, &name)?;
    for i in 0..recon.len() {
        writeln!(
            out,
            "{} {}",
            recon.time[i],
            engine.image_cont[i] * recon.norm
        )
        .map_err(io_err(&cfg.output_dir, &name))?;
    }
    drop(out);

    log::info!("start joint reverberation phase");
    let (mut low, mut up, mut x) = response_bounds(setup.npixel, engine.rm.dt, cfg);
    let (cont_low, cont_up) = cont_bounds(recon);
    low.extend_from_slice(&cont_low);
    up.extend_from_slice(&cont_up);
    x.extend(engine.image_cont.iter());
    let mut x_old = x.clone();

    let fmin = (line.len() + cont_data.len()) as f64;
    let stage = Stage::new(cfg.tol, cfg.nfeval_max, fmin);
    let f_init = initial_stage(&mut engine, &stage, &mut x, &low, &up);
    x_old.copy_from_slice(&x);

    if uniform {
        uniform_outer(
            &mut engine,
            &stage,
            &mut x,
            &mut x_old,
            &low,
            &up,
            fmin,
            cfg.low_bound(),
            cfg.npixon(),
            cfg.sensitivity,
            f_init,
        );
    } else {
        adaptive_outer(
            &mut engine,
            &stage,
            &mut x,
            &mut x_old,
            &low,
            &up,
            fmin,
            cfg.low_bound(),
        );
    }

    engine.compute_rm_pixon(&x_old);
    let image_cont = engine.image_cont.clone();
    write_outputs(cfg, mode, &engine.rm, &x_old, &image_cont, None)
}

/// DRW-prior continuum mode.
fn run_drw(
    cont_model: &ContModel,
    recon: &LightCurve,
    line: &LightCurve,
    cfg: &Config,
    setup: &ModeSetup,
) -> Result<(), PixonError> {
    let uniform = cfg.pixon_uniform;
    let mode = if uniform { "drw_uniform" } else { "drw" };
    log::info!("************************************************************");
    log::info!("start run_{mode}, npixon_size: {}", cfg.npixon());

    let (shat, qmat) = cont_model.conditional()?;
    let mut engine = PixonDrw::new(
        recon,
        line,
        setup.npixel,
        setup.kernel,
        setup.sizes(cfg),
        setup.ipositive,
        cfg.sensitivity,
        shat,
        qmat,
    );
    let fmin = line.len() as f64;
    let stage = Stage::new(cfg.tol, cfg.nfeval_max, fmin);

    let (mut low, mut up, mut x) = response_bounds(setup.npixel, engine.rm.dt, cfg);
    low.extend(std::iter::repeat(-10.0).take(engine.ncont()));
    up.extend(std::iter::repeat(10.0).take(engine.ncont()));
    x.extend(std::iter::repeat(0.0).take(engine.ncont()));
    let mut x_old = x.clone();

    let f_init = initial_stage(&mut engine, &stage, &mut x, &low, &up);
    x_old.copy_from_slice(&x);

    if uniform {
        uniform_outer(
            &mut engine,
            &stage,
            &mut x,
            &mut x_old,
            &low,
            &up,
            fmin,
            cfg.low_bound(),
            cfg.npixon(),
            cfg.sensitivity,
            f_init,
        );
    } else {
        adaptive_outer(
            &mut engine,
            &stage,
            &mut x,
            &mut x_old,
            &low,
            &up,
            fmin,
            cfg.low_bound(),
        );
    }

    engine.compute_rm_pixon(&x_old);
    let cont_flux = engine.rm.cont_flux.clone();
    write_outputs(
        cfg,
        mode,
        &engine.rm,
        &x_old,
        &cont_flux,
        Some(&recon.error),
    )
}

/// Fixed-continuum mode: the DRW reconstruction drives the convolution as-is.
fn run_contfix(
    recon: &LightCurve,
    line: &LightCurve,
    cfg: &Config,
    setup: &ModeSetup,
) -> Result<(), PixonError> {
    let uniform = cfg.pixon_uniform;
    let mode = if uniform { "contfix_uniform" } else { "contfix" };
    log::info!("************************************************************");
    log::info!("start run_{mode}, npixon_size: {}", cfg.npixon());

    let mut engine = Pixon::new(
        recon,
        line,
        setup.npixel,
        setup.kernel,
        setup.sizes(cfg),
        setup.ipositive,
        cfg.sensitivity,
    );
    let fmin = line.len() as f64;
    let stage = Stage::new(cfg.tol, cfg.nfeval_max, fmin);

    let (low, up, mut x) = response_bounds(setup.npixel, engine.dt, cfg);
    let mut x_old = x.clone();

    let f_init = initial_stage(&mut engine, &stage, &mut x, &low, &up);
    x_old.copy_from_slice(&x);

    if uniform {
        uniform_outer(
            &mut engine,
            &stage,
            &mut x,
            &mut x_old,
            &low,
            &up,
            fmin,
            cfg.low_bound(),
            cfg.npixon(),
            cfg.sensitivity,
            f_init,
        );
    } else {
        adaptive_outer(
            &mut engine,
            &stage,
            &mut x,
            &mut x_old,
            &low,
            &up,
            fmin,
            cfg.low_bound(),
        );
    }

    engine.compute_rm_pixon(&x_old);
    let cont_flux = engine.cont_flux.clone();
    write_outputs(cfg, mode, &engine, &x_old, &cont_flux, Some(&recon.error))
}

/// Full pipeline: load and normalise the light curves, reconstruct the
/// continuum with the DRW model, then run every requested mode.
pub fn run(cfg: &Config) -> Result<(), PixonError> {
    cfg.validate()?;
    std::fs::create_dir_all(&cfg.output_dir).map_err(|source| PixonError::Io {
        path: cfg.output_dir.clone(),
        source,
    })?;

    let mut cont_data = LightCurve::load(&cfg.fcont)?;
    cont_data.normalize()?;
    let mut line_data = LightCurve::load(&cfg.fline)?;
    line_data.normalize()?;

    log::info!("start continuum reconstruction");
    // Extend the reconstruction beyond the observed baseline so the delay
    // convolution has no edge deficit.
    let text = 0.1 * cont_data.span().max(line_data.span());
    let t_back = (cont_data.time[0] - (line_data.time[0] - cfg.tau_range_up - text)).max(text);
    let t_forward = ((line_data.time[line_data.len() - 1] - cfg.tau_range_low + text)
        - cont_data.time[cont_data.len() - 1])
        .max(text);

    let mut cont_model = ContModel::new(cont_data.clone(), t_back, t_forward, cfg.tau_interval)?;
    let sampler = MhSampler {
        num_steps: cfg.mcmc_steps,
        num_burn: cfg.mcmc_steps / 4,
        thin: 5,
        seed: cfg.mcmc_seed,
    };
    cont_model.mcmc(&sampler, cfg.output_dir.join("posterior_sample.txt"))?;
    cont_model.reconstruct()?;
    let (sigmad, taud, syserr) = cont_model.drw_params();
    log::info!("drw parameters: sigma={sigmad:.6}, tau={taud:.4}, syserr={syserr:.6}");

    let name = "cont_recon.txt";
    let mut out = create_output(&cfg.output_dir, name)?;
    for i in 0..cont_model.recon.len() {
        writeln!(
            out,
            "{}  {}  {}",
            cont_model.recon.time[i],
            cont_model.recon.flux[i],
            cont_model.recon.error[i]
        )
        .map_err(io_err(&cfg.output_dir, name))?;
    }
    drop(out);

    let recon = cont_model.recon.clone();
    let setup = ModeSetup::new(cfg, &recon)?;

    if cfg.drv_lc_model == DRV_MODEL_CONT_PIXON || cfg.drv_lc_model == DRV_MODEL_ALL {
        run_pixon(&cont_data, &recon, &line_data, cfg, &setup)?;
    }
    if cfg.drv_lc_model == DRV_MODEL_DRW || cfg.drv_lc_model == DRV_MODEL_ALL {
        run_drw(&cont_model, &recon, &line_data, cfg, &setup)?;
    }
    if cfg.drv_lc_model == DRV_MODEL_CONT_FIX || cfg.drv_lc_model == DRV_MODEL_ALL {
        run_contfix(&recon, &line_data, cfg, &setup)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recon_grid() -> LightCurve {
        LightCurve::regular(-30.0, 1.0, 120)
    }

    #[test]
    fn zero_lag_index_follows_the_delay_range() {
        let recon = recon_grid();
        let mut cfg = Config::default();
        cfg.tau_range_low = 0.0;
        cfg.tau_range_up = 20.0;
        cfg.tau_interval = 1.0;
        let setup = ModeSetup::new(&cfg, &recon).unwrap();
        assert_eq!(setup.ipositive, 0);
        assert_eq!(setup.npixel, 20);

        cfg.tau_range_low = -5.0;
        let setup = ModeSetup::new(&cfg, &recon).unwrap();
        assert_eq!(setup.ipositive, 5);
        assert_eq!(setup.npixel, 25);
    }

    #[test]
    fn too_wide_delay_range_is_rejected() {
        let recon = recon_grid();
        let mut cfg = Config::default();
        cfg.tau_range_low = 0.0;
        cfg.tau_range_up = 500.0;
        cfg.tau_interval = 1.0;
        assert!(matches!(
            ModeSetup::new(&cfg, &recon),
            Err(PixonError::Config(_))
        ));
    }

    #[test]
    fn fixed_background_pins_its_bounds() {
        let mut cfg = Config::default();
        cfg.fix_bg = true;
        cfg.bg = 0.05;
        let (low, up, x) = response_bounds(10, 1.0, &cfg);
        assert_eq!(low.len(), 11);
        assert_eq!(low[10], 0.05);
        assert_eq!(up[10], 0.05);
        assert_eq!(x[10], 0.05);
    }

    #[test]
    fn free_background_is_bounded_to_the_unit_band() {
        let cfg = Config::default();
        let (low, up, x) = response_bounds(8, 0.5, &cfg);
        assert_eq!(low[8], -1.0);
        assert_eq!(up[8], 1.0);
        assert_eq!(x[8], 0.0);
        assert!((x[0] - f64::ln(1.0 / 4.0)).abs() < 1e-12);
    }
}
