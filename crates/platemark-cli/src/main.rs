//! platemark CLI — detect and measure logo alignment on press-plate images.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use platemark::{BgrFrame, CalibrationData, Detector, DetectorConfig};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "platemark")]
#[command(about = "Detect planar logos on textile press plates and measure their alignment")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect all configured logos in an image.
    Detect {
        /// Detector configuration (JSON).
        #[arg(long)]
        config: PathBuf,

        /// Input image.
        #[arg(long)]
        image: PathBuf,

        /// Calibration file overriding the configured homography (JSON).
        #[arg(long)]
        calibration: Option<PathBuf>,

        /// Write results here instead of stdout (JSON).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate a configuration, loading and describing every template.
    Validate {
        /// Detector configuration (JSON).
        #[arg(long)]
        config: PathBuf,
    },

    /// Print the expected logo positions and search windows in pixels.
    ExpectedPositions {
        /// Detector configuration (JSON).
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            config,
            image,
            calibration,
            out,
        } => run_detect(&config, &image, calibration.as_deref(), out.as_deref()),
        Commands::Validate { config } => run_validate(&config),
        Commands::ExpectedPositions { config } => run_expected_positions(&config),
    }
}

fn build_detector(config_path: &Path) -> CliResult<Detector> {
    let config = DetectorConfig::from_json_file(config_path)?;
    Ok(Detector::new(config)?)
}

/// Decode an image file into the packed BGR layout the engine consumes.
fn load_bgr(path: &Path) -> CliResult<(u32, u32, Vec<u8>)> {
    let rgb = image::open(path)?.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut buf = Vec::with_capacity((w * h * 3) as usize);
    for p in rgb.pixels() {
        buf.extend_from_slice(&[p[2], p[1], p[0]]);
    }
    Ok((w, h, buf))
}

fn run_detect(
    config_path: &Path,
    image_path: &Path,
    calibration_path: Option<&Path>,
    out: Option<&Path>,
) -> CliResult<()> {
    let detector = build_detector(config_path)?;
    let (w, h, buf) = load_bgr(image_path)?;
    let frame = BgrFrame::new(w, h, &buf)?;

    let results = match calibration_path {
        Some(path) => {
            let cal = CalibrationData::from_json_file(path)?;
            detector.detect_with_homography(&frame, Some(&cal.homography))?
        }
        None => detector.detect(&frame)?,
    };

    let json = serde_json::to_string_pretty(&results)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn run_validate(config_path: &Path) -> CliResult<()> {
    let detector = build_detector(config_path)?;
    println!("configuration OK: {} logos", detector.config().logos.len());
    for (name, keypoints) in detector.template_keypoint_counts() {
        println!("  {name}: {keypoints} template keypoints");
    }
    Ok(())
}

fn run_expected_positions(config_path: &Path) -> CliResult<()> {
    let detector = build_detector(config_path)?;
    for (name, [x, y]) in detector.expected_positions_px() {
        let bounds = detector
            .roi_bounds_px(&name)
            .map(|[x1, y1, x2, y2]| format!("roi [{x1}, {y1}, {x2}, {y2}]"))
            .unwrap_or_default();
        println!("{name}: centre ({x:.1}, {y:.1}) px, {bounds}");
    }
    Ok(())
}
