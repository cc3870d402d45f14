//! Run configuration, deserialisable from TOML with per-field defaults.

use crate::basis::PixonBasis;
use crate::error::PixonError;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which continuum treatment(s) to run.
pub const DRV_MODEL_CONT_PIXON: u8 = 0;
pub const DRV_MODEL_DRW: u8 = 1;
pub const DRV_MODEL_CONT_FIX: u8 = 2;
pub const DRV_MODEL_ALL: u8 = 3;

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Continuum light-curve path.
    pub fcont: PathBuf,
    /// Emission-line light-curve path.
    pub fline: PathBuf,
    /// Output directory for the fixed-name result files.
    pub output_dir: PathBuf,

    /// Lower delay bound in days; may be negative for pre-onset lags.
    pub tau_range_low: f64,
    /// Upper delay bound in days.
    pub tau_range_up: f64,
    /// Reconstruction step of the regular grid, also the delay-grid step.
    pub tau_interval: f64,

    /// Kernel family code, 0 parabloid .. 6 tophat.
    pub pixon_basis_type: u8,
    pub pixon_sub_factor: u32,
    pub pixon_size_factor: u32,
    /// Smallest pixon index the outer loop may reach; defaults to
    /// `pixon_sub_factor - 1`.
    pub pixon_map_low_bound: Option<usize>,
    pub max_pixon_size: u32,
    /// Uniform (single-size) instead of adaptive pixon map.
    pub pixon_uniform: bool,

    /// 0 continuum-pixon, 1 DRW continuum, 2 fixed DRW continuum, 3 all.
    pub drv_lc_model: u8,

    pub fix_bg: bool,
    pub bg: f64,

    pub tol: f64,
    pub nfeval_max: usize,
    /// MDL shrink-test sensitivity `sigma_ctl`.
    pub sensitivity: f64,

    /// Monte-Carlo steps of the DRW hyperparameter sampler.
    pub mcmc_steps: usize,
    pub mcmc_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fcont: PathBuf::from("data/con.txt"),
            fline: PathBuf::from("data/line.txt"),
            output_dir: PathBuf::from("data"),
            tau_range_low: 0.0,
            tau_range_up: 900.0,
            tau_interval: 10.0,
            pixon_basis_type: 1,
            pixon_sub_factor: 1,
            pixon_size_factor: 1,
            pixon_map_low_bound: None,
            max_pixon_size: 30,
            pixon_uniform: false,
            drv_lc_model: DRV_MODEL_ALL,
            fix_bg: false,
            bg: 0.0,
            tol: 1.0e-6,
            nfeval_max: 10000,
            sensitivity: 1.0,
            mcmc_steps: 20000,
            mcmc_seed: 42,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PixonError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| PixonError::Io {
            path: path.into(),
            source,
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|err| PixonError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PixonError> {
        if !(self.tau_range_up > self.tau_range_low) {
            return Err(PixonError::Config(
                "tau_range_up must exceed tau_range_low".into(),
            ));
        }
        if !(self.tau_interval > 0.0) {
            return Err(PixonError::Config("tau_interval must be positive".into()));
        }
        if self.pixon_sub_factor == 0 || self.pixon_size_factor == 0 || self.max_pixon_size == 0 {
            return Err(PixonError::Config(
                "pixon factors and max_pixon_size must be positive".into(),
            ));
        }
        if self.drv_lc_model > DRV_MODEL_ALL {
            return Err(PixonError::Config("drv_lc_model must be 0..=3".into()));
        }
        PixonBasis::from_code(self.pixon_basis_type)?;
        if self.fix_bg && !(-1.0..=1.0).contains(&self.bg) {
            return Err(PixonError::Config(
                "fixed background must lie in [-1, 1] (normalised units)".into(),
            ));
        }
        Ok(())
    }

    pub fn basis(&self) -> Result<PixonBasis, PixonError> {
        PixonBasis::from_code(self.pixon_basis_type)
    }

    /// The tophat basis only supports unit sub-pixel granularity.
    pub fn effective_sub_factor(&self) -> u32 {
        if self.pixon_basis_type == 6 {
            1
        } else {
            self.pixon_sub_factor
        }
    }

    /// Initial number of pixon sizes.
    pub fn npixon(&self) -> usize {
        (self.max_pixon_size * self.effective_sub_factor() / self.pixon_size_factor).max(2) as usize
    }

    /// Smallest pixon index the outer loops may keep shrinking towards.
    pub fn low_bound(&self) -> usize {
        self.pixon_map_low_bound
            .unwrap_or((self.effective_sub_factor() - 1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.npixon(), 30);
        assert_eq!(config.low_bound(), 0);
    }

    #[test]
    fn toml_round_trip_with_partial_fields() {
        let config: Config = toml::from_str(
            r#"
            fcont = "data/cont_sim.txt"
            tau_range_up = 120.0
            tau_interval = 1.0
            pixon_basis_type = 6
            pixon_sub_factor = 2
            pixon_uniform = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.fcont, PathBuf::from("data/cont_sim.txt"));
        assert!(config.pixon_uniform);
        // Tophat clamps the sub-pixel factor.
        assert_eq!(config.effective_sub_factor(), 1);
        assert_eq!(config.low_bound(), 0);
    }

    #[test]
    fn rejects_inverted_delay_range() {
        let mut config = Config::default();
        config.tau_range_low = 10.0;
        config.tau_range_up = 5.0;
        assert!(matches!(config.validate(), Err(PixonError::Config(_))));
    }

    #[test]
    fn rejects_unknown_basis_code() {
        let mut config = Config::default();
        config.pixon_basis_type = 9;
        assert!(config.validate().is_err());
    }
}
