use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use collimation::config::RingCalibration;
use collimation::simulation::{compact_config, SimulatedSpectrograph};
use collimation::{
    Bypass, CollimationConfig, CollimationOptions, CollimationSequence, DecisionEngine,
    MoveGates, SequenceOptions, SequenceOutcome,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run a collimation sequence against a simulated spectrograph",
    long_about = None
)]
struct Args {
    #[arg(long, help = "Collimation config JSON (defaults to a compact simulated layout)")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Spectrograph to collimate", default_value = "sp1")]
    spectrograph: String,

    #[arg(
        long,
        help = "Initial collimator position in steps (best focus of the red camera is 0)",
        default_value = "6000",
        allow_hyphen_values = true
    )]
    initial_offset: f64,

    #[arg(
        long,
        help = "Best-focus position of ring-calibrated cameras, in steps",
        default_value = "0",
        allow_hyphen_values = true
    )]
    ring_camera_offset: f64,

    #[arg(long, help = "Maximum number of cycles", default_value = "3")]
    cycles: usize,

    #[arg(long, help = "Checks to bypass (only \"ffs\" is supported)")]
    bypass: Vec<Bypass>,

    #[arg(long, help = "Random seed for the simulated frames", default_value = "1")]
    seed: u64,

    #[arg(long, help = "Analyse only; do not move motors")]
    analysis_only: bool,

    #[arg(long, help = "Move the collimator even when a ring move is pending")]
    ignore_residuals: bool,

    #[arg(long, help = "Request only the ring move needed to reach tolerance")]
    min_ring_correction: bool,

    #[arg(long, help = "Skip header and light checks")]
    no_check_image: bool,

    #[arg(long, help = "Print every cycle's status report as JSON")]
    json: bool,
}

fn load_config(args: &Args) -> Result<CollimationConfig> {
    match &args.config {
        Some(path) => CollimationConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(compact_config()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = Arc::new(load_config(&args)?);
    let spec = config
        .spectrograph(&args.spectrograph)
        .context("Unknown spectrograph")?
        .clone();

    let sim = SimulatedSpectrograph::new(config.clone(), args.seed);
    sim.set_collimator(&args.spectrograph, args.initial_offset);
    for camera in &spec.cameras {
        if let RingCalibration::Steps { .. } = config.camera(camera)?.calibration.ring {
            sim.set_best_position(camera, args.ring_camera_offset);
        }
    }

    let options = SequenceOptions {
        max_cycles: args.cycles,
        move_motors: !args.analysis_only,
        collimation: CollimationOptions {
            no_check_image: args.no_check_image,
            ignore_residuals: args.ignore_residuals,
            min_ring_correction: args.min_ring_correction,
            bypass: args.bypass.clone(),
            analysis_region: None,
        },
        ..SequenceOptions::default()
    };

    info!(
        "Collimating {} ({}) from collimator position {}",
        args.spectrograph,
        spec.cameras.join(", "),
        args.initial_offset
    );

    let gates = MoveGates::new();
    let sequence = CollimationSequence::new(
        DecisionEngine::new(config.clone()),
        &args.spectrograph,
        sim.clone(),
        sim.clone(),
        options,
    );
    let handle = sequence.spawn(&gates).context("Failed to start sequence")?;

    for report in handle.results().iter() {
        let plan = &report.plan;
        println!("Cycle {}: {:?}", report.cycle, plan.status);
        if report.interrupted {
            println!("  moves interrupted; the plan was only partly applied");
        }
        println!("  {}", plan.reason);
        for camera in &plan.cameras {
            match (camera.shift_px, camera.pixel_offset) {
                (Some(shift), Some(offset)) => println!(
                    "  {}: shift {shift:+.3} px, focus error {offset:+.3} px",
                    camera.camera
                ),
                _ => println!(
                    "  {}: excluded ({})",
                    camera.camera,
                    camera.reason.as_deref().unwrap_or("no reason given")
                ),
            }
        }
        if args.json {
            println!("{}", plan.status_report().to_json()?);
        }
    }

    let outcome = handle.join().context("Sequence did not complete")?;
    match &outcome {
        SequenceOutcome::Converged { cycles, .. } => println!("Converged after {cycles} cycle(s)"),
        SequenceOutcome::AnalysisOnly { .. } => println!("Analysis only, no moves made"),
        SequenceOutcome::Failed { cycles, plan } => {
            println!("Failed in cycle {cycles}: {}", plan.reason)
        }
        SequenceOutcome::CyclesExhausted { cycles, .. } => {
            println!("Still out of focus after {cycles} cycle(s)")
        }
    }

    println!("Final state:");
    println!(
        "  collimator: {:.0} steps",
        sim.collimator(&args.spectrograph).unwrap_or_default()
    );
    for camera in &spec.cameras {
        println!(
            "  {camera}: focus error {:+.1} steps, ring {:+.2} deg",
            sim.focus_error(camera).unwrap_or_default(),
            sim.ring(camera).unwrap_or_default()
        );
    }
    for command in sim.commands() {
        println!("  issued {command:?}");
    }

    Ok(())
}
