use clap::Parser;
use pixon_rm::{run, Config, PixonError};

use std::path::PathBuf;

/// Pixon-based reconstruction of reverberation-mapping transfer functions.
#[derive(Parser)]
#[command(name = "pixon-rm", version, about)]
struct Args {
    /// TOML configuration file; built-in defaults are used when omitted.
    config: Option<PathBuf>,

    /// Override the pixon basis type (0 parabloid, 1 gaussian, 2 modified
    /// gaussian, 3 lorentz, 4 wendland, 5 triangle, 6 tophat).
    #[arg(short, long)]
    basis: Option<u8>,
}

fn try_main(args: &Args) -> Result<(), PixonError> {
    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(code) = args.basis {
        cfg.pixon_basis_type = code;
    }
    log::info!(
        "pixon basis: {} ({})",
        cfg.pixon_basis_type,
        cfg.basis()?.name()
    );
    run(&cfg)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = try_main(&args) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
