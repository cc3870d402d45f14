//! Light-curve containers and the whitespace-separated text loader.

use crate::error::PixonError;

use itertools::Itertools;
use ndarray::Array1;
use std::fs;
use std::path::Path;

/// A sampled light curve: three parallel sequences of equal length.
///
/// `time` is strictly increasing and `error` is strictly positive; both are
/// checked at construction. `norm` records the flux scale divided out by
/// [`LightCurve::normalize`] so writers can restore physical units.
#[derive(Clone, Debug, Default)]
pub struct LightCurve {
    pub time: Array1<f64>,
    pub flux: Array1<f64>,
    pub error: Array1<f64>,
    pub norm: f64,
}

impl LightCurve {
    pub fn new(
        time: Array1<f64>,
        flux: Array1<f64>,
        error: Array1<f64>,
    ) -> Result<Self, PixonError> {
        assert_eq!(time.len(), flux.len(), "time and flux must have the same size");
        assert_eq!(flux.len(), error.len(), "flux and error must have the same size");
        if let Some(i) = time.iter().tuple_windows().position(|(a, b)| b <= a) {
            return Err(PixonError::UnsortedTimes(i + 1));
        }
        if let Some(i) = error.iter().position(|&e| !(e > 0.0)) {
            return Err(PixonError::BadUncertainty(i));
        }
        Ok(Self {
            time,
            flux,
            error,
            norm: 1.0,
        })
    }

    /// Load a `time flux error` text file, one record per line.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PixonError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| PixonError::Io {
            path: path.into(),
            source,
        })?;

        let mut time = Vec::new();
        let mut flux = Vec::new();
        let mut error = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace().map(str::parse::<f64>);
            match (fields.next(), fields.next(), fields.next()) {
                (Some(Ok(t)), Some(Ok(f)), Some(Ok(e))) => {
                    time.push(t);
                    flux.push(f);
                    error.push(e);
                }
                _ => {
                    return Err(PixonError::MalformedRecord {
                        path: path.into(),
                        record: i + 1,
                    });
                }
            }
        }
        log::info!("\"{}\" has {} records", path.display(), time.len());

        Self::new(time.into(), flux.into(), error.into()).map_err(|err| match err {
            PixonError::UnsortedTimes(i) | PixonError::BadUncertainty(i) => {
                PixonError::MalformedRecord {
                    path: path.into(),
                    record: i + 1,
                }
            }
            other => other,
        })
    }

    /// Regular grid with `n` samples starting at `t0`; fluxes and errors zero.
    pub fn regular(t0: f64, dt: f64, n: usize) -> Self {
        Self {
            time: Array1::from_iter((0..n).map(|i| t0 + dt * i as f64)),
            flux: Array1::zeros(n),
            error: Array1::zeros(n),
            norm: 1.0,
        }
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Total time span `t_last - t_0`.
    pub fn span(&self) -> f64 {
        self.time[self.len() - 1] - self.time[0]
    }

    pub fn mean_error(&self) -> f64 {
        self.error.sum() / self.len() as f64
    }

    /// Divide fluxes and uncertainties by the mean flux, recording the scale.
    pub fn normalize(&mut self) -> Result<(), PixonError> {
        let mean = self.flux.sum() / self.len() as f64;
        if !(mean > 0.0) {
            return Err(PixonError::Config(
                "light curve has non-positive mean flux, cannot normalize".into(),
            ));
        }
        self.flux /= mean;
        self.error /= mean;
        self.norm *= mean;
        Ok(())
    }
}

/// Linear interpolation on a regular grid, clamped to the boundary samples.
///
/// `idx` is the fractional grid position `(t - t0) / dt`.
pub(crate) fn lerp(values: &Array1<f64>, idx: f64) -> f64 {
    let n = values.len();
    if idx <= 0.0 {
        return values[0];
    }
    let i = idx as usize;
    if i >= n - 1 {
        return values[n - 1];
    }
    values[i] + (values[i + 1] - values[i]) * (idx - i as f64)
}
