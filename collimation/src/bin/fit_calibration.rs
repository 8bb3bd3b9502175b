use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use collimation::calibration::fit_calibration;
use collimation::{CalibrationSample, ConfigStorage, Observatory};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Site {
    Apo,
    Lco,
}

impl From<Site> for Observatory {
    fn from(site: Site) -> Self {
        match site {
            Site::Apo => Observatory::Apo,
            Site::Lco => Observatory::Lco,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fit collimator calibration slopes from focus-sweep samples",
    long_about = None
)]
struct Args {
    #[arg(help = "CSV with columns camera,collimator,offset")]
    input: PathBuf,

    #[arg(long, help = "Only fit these cameras")]
    camera: Vec<String>,

    #[arg(long, help = "Config directory (defaults to ~/.hartmann)")]
    config_dir: Option<PathBuf>,

    #[arg(long, help = "Print fits without saving them")]
    dry_run: bool,

    #[arg(
        long,
        help = "Also write the fitted slopes into this site's stored collimation config",
        value_enum
    )]
    apply_to: Option<Site>,
}

#[derive(Debug, Deserialize)]
struct SweepRow {
    camera: String,
    collimator: f64,
    offset: f64,
}

fn read_samples(args: &Args) -> Result<BTreeMap<String, Vec<CalibrationSample>>> {
    let mut reader = csv::Reader::from_path(&args.input)
        .with_context(|| format!("Failed to open {}", args.input.display()))?;

    let mut samples: BTreeMap<String, Vec<CalibrationSample>> = BTreeMap::new();
    for (line, row) in reader.deserialize::<SweepRow>().enumerate() {
        let row = row.with_context(|| format!("Bad row {} in {}", line + 2, args.input.display()))?;
        if !args.camera.is_empty() && !args.camera.contains(&row.camera) {
            continue;
        }
        samples.entry(row.camera).or_default().push(CalibrationSample {
            collimator_position: row.collimator,
            offset_px: row.offset,
        });
    }
    Ok(samples)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let storage = match &args.config_dir {
        Some(dir) => ConfigStorage::with_path(dir.clone()),
        None => ConfigStorage::new().context("Failed to locate config directory")?,
    };

    let samples = read_samples(&args)?;
    if samples.is_empty() {
        bail!("No samples in {}", args.input.display());
    }

    let mut fitted = 0;
    for (camera, camera_samples) in &samples {
        let fit = match fit_calibration(camera, camera_samples) {
            Ok(fit) => fit,
            Err(e) => {
                warn!("{camera}: {e}");
                continue;
            }
        };
        println!(
            "{camera}: slope {:.1} steps/px, intercept {:.1} steps, rms {:.1} steps ({} points)",
            fit.slope, fit.intercept, fit.rms_error, fit.num_points
        );
        fitted += 1;

        if !args.dry_run {
            let path = storage
                .save_calibration(&fit)
                .with_context(|| format!("Failed to save calibration for {camera}"))?;
            info!("Saved {}", path.display());
        }
    }

    if fitted == 0 {
        bail!("No camera had enough samples to fit");
    }

    if let (Some(site), false) = (args.apply_to, args.dry_run) {
        let observatory = Observatory::from(site);
        let config = storage
            .collimation_config_or_builtin(observatory)
            .context("Failed to load collimation config")?;
        let config = storage
            .apply_calibrations(config)
            .context("Failed to apply calibrations")?;
        let path = storage
            .save_collimation_config(&config)
            .context("Failed to save collimation config")?;
        println!("Updated {}", path.display());
    }

    Ok(())
}
