//! holegrid CLI — detect support-film apertures in a grid image.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use holegrid::{
    GraySamples, HoleFinder, HoleSequence, InitParams, SequenceParams, SequenceProgress,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "holegrid")]
#[command(about = "Detect regularly spaced circular holes in specimen-grid images")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect holes in a single image.
    Detect(DetectArgs),
}

#[derive(Debug, Clone, Args)]
struct DetectArgs {
    /// Path to the input image (single-channel).
    #[arg(long)]
    image: PathBuf,

    /// Path to write detection results (JSON).
    #[arg(long)]
    out: PathBuf,

    /// Expected hole spacing in pixels.
    #[arg(long, default_value = "40.0")]
    spacing: f32,

    /// Expected hole diameter in pixels.
    #[arg(long, default_value = "20.0")]
    diameter: f32,

    /// Linear reduction factor applied before analysis.
    #[arg(long, default_value = "1.0")]
    reduction: f32,

    /// Comma-separated smoothing settings to scan (negative = median passes).
    #[arg(long, value_delimiter = ',')]
    sigmas: Vec<f32>,

    /// Comma-separated high kept-fraction thresholds to scan.
    #[arg(long, value_delimiter = ',')]
    thresholds: Vec<f32>,

    /// Disable the averaged-template refinement pass.
    #[arg(long)]
    no_template_pass: bool,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();
}

fn run_detect(args: &DetectArgs) -> CliResult<()> {
    let image = image::open(&args.image)?;
    let samples = GraySamples::from_dynamic(&image.grayscale())?;

    let mut params = SequenceParams::from_spacing_and_diameter(args.spacing, args.diameter);
    if !args.sigmas.is_empty() {
        params.sigmas = args.sigmas.clone();
    }
    if !args.thresholds.is_empty() {
        params.thresholds = args.thresholds.clone();
    }
    if args.no_template_pass {
        params.use_template_pass = false;
    }

    let mut finder = HoleFinder::new();
    finder.initialize(
        &samples,
        &InitParams {
            reduction: args.reduction,
            max_radius: args.diameter,
            ..InitParams::default()
        },
    )?;

    let mut sequence = HoleSequence::new(params);
    let outcome = loop {
        match sequence.step(&mut finder)? {
            SequenceProgress::InProgress(summary) => {
                tracing::info!(
                    sigma = summary.sigma,
                    threshold = summary.threshold,
                    accepted = summary.accepted,
                    missing = summary.missing,
                    "combination scanned"
                );
            }
            SequenceProgress::Finished(outcome) => break outcome,
        }
    };

    tracing::info!(
        points = outcome.points.len(),
        missing = outcome.missing.len(),
        radius = outcome.best_radius,
        spacing = outcome.true_spacing,
        "detection complete"
    );

    let json = serde_json::to_string_pretty(&outcome)?;
    std::fs::write(&args.out, json)?;
    Ok(())
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match &cli.command {
        Commands::Detect(args) => run_detect(args),
    }
}
