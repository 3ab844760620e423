use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use streakscan_common::config::Config;
use streakscan_scanner::classifier::SequentialModel;
use streakscan_scanner::detect::{extract_regions, DiffDetector};
use streakscan_scanner::scan::{ScanError, Scanner};
use streakscan_scanner::source::{load_frame, FrameLoadError, FrameSource, SourceError};
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "streakscan.toml";

#[derive(Parser, Debug)]
#[command(name = "streakscan", version, about = "Find transient anomalies in a frame sequence")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan every adjacent frame pair and write confirmed anomalies as CSV
    Scan(ScanArgs),
    /// Write the change mask of a single frame pair as a PNG
    Diff(DiffArgs),
}

#[derive(Args, Debug, Default)]
struct ScanArgs {
    /// TOML config file [default: streakscan.toml, if present]
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory of extracted frames
    #[arg(long)]
    frames: Option<PathBuf>,
    /// Classifier model file
    #[arg(long)]
    model: Option<PathBuf>,
    /// Output CSV path
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    min_streak_length: Option<u32>,
    #[arg(long)]
    crop_size: Option<u32>,
    /// Process frame pairs in parallel
    #[arg(long)]
    parallel: bool,
}

#[derive(Args, Debug)]
struct DiffArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    frames: Option<PathBuf>,
    /// Sequence number of the earlier frame
    #[arg(long)]
    a: u64,
    /// Sequence number of the later frame
    #[arg(long)]
    b: u64,
    /// Where to write the mask
    #[arg(long, default_value = "diff.png")]
    out: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Scan(ScanArgs::default())) {
        Command::Scan(args) => {
            let config = load_config(args.config.as_deref(), |config| {
                apply_scan_overrides(config, &args)
            });
            init_logging(&config);
            if let Err(e) = run_scan(&config) {
                error!(error = %e, "scan failed");
                std::process::exit(1);
            }
        }
        Command::Diff(args) => {
            let config = load_config(args.config.as_deref(), |config| {
                if let Some(frames) = &args.frames {
                    config.scan.frames_dir = frames.clone();
                }
            });
            init_logging(&config);
            if let Err(e) = run_diff(&config, &args) {
                error!(error = %e, "diff failed");
                std::process::exit(1);
            }
        }
    }
}

/// Load, override and validate the config, exiting on failure.
///
/// Runs before logging is set up, so failures go to stderr.
fn load_config(path: Option<&Path>, overrides: impl FnOnce(&mut Config)) -> Config {
    let (path, loaded) = match path {
        Some(p) => (p.to_path_buf(), Config::load(p)),
        None => {
            let p = PathBuf::from(DEFAULT_CONFIG_PATH);
            let loaded = Config::load_or_default(&p);
            (p, loaded)
        }
    };

    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    overrides(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }
    config
}

fn apply_scan_overrides(config: &mut Config, args: &ScanArgs) {
    if let Some(frames) = &args.frames {
        config.scan.frames_dir = frames.clone();
    }
    if let Some(model) = &args.model {
        config.classifier.model_path = model.clone();
    }
    if let Some(output) = &args.output {
        config.output.path = output.clone();
    }
    if let Some(len) = args.min_streak_length {
        config.scan.min_streak_length = len;
    }
    if let Some(size) = args.crop_size {
        config.classifier.crop_size = size;
    }
    if args.parallel {
        config.scan.parallel = true;
    }
}

fn init_logging(config: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();
}

fn run_scan(config: &Config) -> Result<(), ScanError> {
    info!(
        frames_dir = %config.scan.frames_dir.display(),
        model = %config.classifier.model_path.display(),
        output = %config.output.path.display(),
        min_streak_length = config.scan.min_streak_length,
        crop_size = config.classifier.crop_size,
        parallel = config.scan.parallel,
        "starting streakscan"
    );

    let model = SequentialModel::load(&config.classifier.model_path)?;
    model.ensure_input(config.classifier.crop_size)?;

    let mut scanner = Scanner::new(config, &model);
    let sink = scanner.run()?;
    sink.persist(&config.output.path)?;

    println!(
        "{} anomalies written to {}",
        sink.len(),
        config.output.path.display()
    );
    Ok(())
}

fn run_diff(config: &Config, args: &DiffArgs) -> Result<(), DiffError> {
    let source = FrameSource::open(&config.scan.frames_dir, &config.scan.extensions)?;
    let earlier = source.find(args.a).ok_or(DiffError::MissingFrame(args.a))?;
    let later = source.find(args.b).ok_or(DiffError::MissingFrame(args.b))?;

    let earlier = load_frame(earlier)?;
    let later = load_frame(later)?;
    let mask = DiffDetector::new()
        .detect(&earlier.gray, &later.gray)
        .ok_or(DiffError::DimensionMismatch {
            a: earlier.dimensions(),
            b: later.dimensions(),
        })?;

    let regions = extract_regions(&mask);
    mask.image
        .save(&args.out)
        .map_err(|e| DiffError::WriteMask(args.out.clone(), e))?;

    info!(
        a = args.a,
        b = args.b,
        level = mask.level,
        changed = mask.changed_count(),
        regions = regions.len(),
        out = %args.out.display(),
        "change mask written"
    );
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum DiffError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Frame(#[from] FrameLoadError),
    #[error("no frame with sequence number {0}")]
    MissingFrame(u64),
    #[error("frames differ in size: {a:?} vs {b:?}")]
    DimensionMismatch { a: (u32, u32), b: (u32, u32) },
    #[error("failed to write mask {0}: {1}")]
    WriteMask(PathBuf, image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use streakscan_common::frame::frame_file_name;
    use streakscan_scanner::classifier::ClassifierError;

    /// 2x2 single-channel model that scores every patch as benign.
    const TINY_MODEL: &str = r#"{
        "input_shape": [2, 2, 1],
        "layers": [
            {"type": "flatten"},
            {"type": "dense", "units": 1, "activation": "sigmoid",
             "weights": [0.0, 0.0, 0.0, 0.0], "bias": [5.0]}
        ]
    }"#;

    /// Frames dir with `frames` blank frames, a model file, and an output
    /// path inside a temp dir.
    fn scan_setup(dir: &Path, frames: u64, model: Option<&str>) -> Config {
        let frames_dir = dir.join("frames");
        std::fs::create_dir(&frames_dir).unwrap();
        for seq in 0..frames {
            RgbImage::from_pixel(16, 16, Rgb([0, 0, 0]))
                .save(frames_dir.join(frame_file_name(seq, "png")))
                .unwrap();
        }

        let model_path = dir.join("model.json");
        if let Some(text) = model {
            std::fs::write(&model_path, text).unwrap();
        }

        let mut config = Config::default();
        config.scan.frames_dir = frames_dir;
        config.classifier.model_path = model_path;
        config.classifier.crop_size = 2;
        config.output.path = dir.join("anomalies.csv");
        config
    }

    #[test]
    fn single_frame_writes_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = scan_setup(dir.path(), 1, Some(TINY_MODEL));

        let err = run_scan(&config).unwrap_err();
        assert!(matches!(
            err,
            ScanError::Source(SourceError::NotEnoughFrames { found: 1, .. })
        ));
        assert!(!config.output.path.exists());
    }

    #[test]
    fn missing_model_aborts_before_scanning() {
        let dir = tempfile::tempdir().unwrap();
        let config = scan_setup(dir.path(), 3, None);

        let err = run_scan(&config).unwrap_err();
        assert!(matches!(err, ScanError::Classifier(ClassifierError::Read(_, _))));
        assert!(!config.output.path.exists());
    }

    #[test]
    fn model_for_another_crop_size_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = scan_setup(dir.path(), 3, Some(TINY_MODEL));
        config.classifier.crop_size = 64;

        let err = run_scan(&config).unwrap_err();
        assert!(matches!(
            err,
            ScanError::Classifier(ClassifierError::InputMismatch { .. })
        ));
        assert!(!config.output.path.exists());
    }

    #[test]
    fn clean_scan_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = scan_setup(dir.path(), 3, Some(TINY_MODEL));

        run_scan(&config).unwrap();
        assert_eq!(
            std::fs::read_to_string(&config.output.path).unwrap(),
            "frame_number,x,y\n"
        );
    }

    #[test]
    fn no_subcommand_means_scan() {
        let cli = Cli::try_parse_from(["streakscan"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn scan_flags_override_config() {
        let cli = Cli::try_parse_from([
            "streakscan",
            "scan",
            "--frames",
            "clips/frames",
            "--min-streak-length",
            "12",
            "--crop-size",
            "32",
            "--parallel",
        ])
        .unwrap();
        let Some(Command::Scan(args)) = cli.command else {
            panic!("expected scan");
        };

        let mut config = Config::default();
        apply_scan_overrides(&mut config, &args);
        assert_eq!(config.scan.frames_dir, PathBuf::from("clips/frames"));
        assert_eq!(config.scan.min_streak_length, 12);
        assert_eq!(config.classifier.crop_size, 32);
        assert!(config.scan.parallel);
        assert_eq!(config.output.path, PathBuf::from("anomalies.csv"));
    }

    #[test]
    fn diff_requires_both_frames() {
        assert!(Cli::try_parse_from(["streakscan", "diff", "--a", "1"]).is_err());
        let cli = Cli::try_parse_from(["streakscan", "diff", "--a", "1", "--b", "2"]).unwrap();
        let Some(Command::Diff(args)) = cli.command else {
            panic!("expected diff");
        };
        assert_eq!((args.a, args.b), (1, 2));
        assert_eq!(args.out, PathBuf::from("diff.png"));
    }
}
