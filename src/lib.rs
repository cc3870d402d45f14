#![doc = include_str!("../README.md")]


mod basis;
pub use basis::{
    Gaussian, Lorentz, ModifiedGaussian, Parabloid, PixonBasis, PixonKernel, PixonKernelTrait,
    PixonSizes, Tophat, Triangle, Wendland,
};

mod config;
pub use config::{
    Config, DRV_MODEL_ALL, DRV_MODEL_CONT_FIX, DRV_MODEL_CONT_PIXON, DRV_MODEL_DRW,
};

mod data;
pub use data::LightCurve;

mod drw;
pub use drw::{ContModel, SemiSeparable};

mod error;
pub use error::PixonError;

mod fft;
pub use fft::{Convolver, PixonFft, RmFft};

mod mcmc;
pub use mcmc::{McmcModel, MhSampler, PosteriorSample, PriorKind};

mod optim;
pub use optim::{
    CobylaProbe, Objective, Stage, StageOutcome, TncOutcome, TncStatus, TruncatedNewton,
};

mod pixon;
pub use pixon::{Pixon, EPS};

mod pixon_cont;
pub use pixon_cont::{ContWarmup, PixonCont};

mod pixon_drw;
pub use pixon_drw::PixonDrw;

mod run;
pub use run::run;

pub use ndarray;
