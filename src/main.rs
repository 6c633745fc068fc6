use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate::audit::FileAuditLog;
use facegate::{
    config, identity, AuthPipeline, BoundingBox, EncodingExtractor, EstimatorFailure,
    ExtractionError, FaceRegion, FeatureVector, LivenessEstimator, LivenessScore, RegionOutcome,
};
use log::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "facegate")]
#[command(
    version,
    about = "Face authentication: encrypted template store and match decisions"
)]
struct Cli {
    /// Config file (defaults to $FACEGATE_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face encoding produced by an external extractor
    Enroll {
        /// Name to enroll under (defaults to current user)
        #[arg(short, long)]
        name: Option<String>,
        /// JSON file holding the encoding as an array of numbers
        #[arg(short, long)]
        encoding: PathBuf,
    },
    /// Run one face through the liveness gate and matcher
    Verify {
        /// JSON file holding the live encoding
        #[arg(short, long)]
        encoding: PathBuf,
        /// Cropped face image handed to the liveness estimator
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Liveness confidence in [0, 1]; without it the face is rejected
        #[arg(short, long)]
        liveness: Option<f32>,
        /// Print the decision as JSON
        #[arg(long)]
        json: bool,
    },
    /// List enrolled faces
    List,
    /// Remove enrolled faces
    Remove {
        /// Record id to remove
        #[arg(long, conflicts_with = "name", required_unless_present = "name")]
        id: Option<Uuid>,
        /// Remove every record enrolled under this name
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete the template store
    Purge,
    /// Show the audit log
    Logs {
        /// Only show the last N entries
        #[arg(short, long)]
        tail: Option<usize>,
    },
    /// Open config file in editor
    Config,
}

/// Hands back an encoding computed ahead of time
struct PrecomputedEncoding(Option<FeatureVector>);

impl EncodingExtractor for PrecomputedEncoding {
    fn extract_encoding(&self, _region: &FaceRegion) -> Result<FeatureVector, ExtractionError> {
        self.0.clone().ok_or(ExtractionError::NotFound)
    }
}

/// Liveness confidence supplied on the command line
struct SuppliedLiveness(Option<f32>);

impl LivenessEstimator for SuppliedLiveness {
    fn estimate_liveness(&self, _region: &FaceRegion) -> Result<LivenessScore, EstimatorFailure> {
        self.0
            .map(LivenessScore::Confidence)
            .ok_or_else(|| EstimatorFailure::new("no liveness score supplied"))
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { name, encoding } => {
            let name = match name {
                Some(name) => name,
                None => identity::current_user_name()?,
            };
            enroll(&cfg, &name, &encoding)
        }
        Commands::Verify {
            encoding,
            image,
            liveness,
            json,
        } => verify(&cfg, &encoding, image.as_deref(), liveness, json),
        Commands::List => list(&cfg),
        Commands::Remove { id, name } => remove(&cfg, id, name.as_deref()),
        Commands::Purge => purge(&cfg),
        Commands::Logs { tail } => logs(&cfg, tail),
        Commands::Config => open_config(&cfg, cli.config.as_deref()),
    }
}

fn read_encoding(path: &Path) -> Result<FeatureVector> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading encoding {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing encoding {}", path.display()))
}

fn read_region(image: Option<&Path>) -> Result<FaceRegion> {
    let image = match image {
        Some(path) => image::open(path)
            .with_context(|| format!("opening image {}", path.display()))?
            .to_rgb8(),
        None => image::RgbImage::new(0, 0),
    };
    let bbox = BoundingBox::new(0, 0, image.width(), image.height());
    Ok(FaceRegion::new(bbox, image))
}

fn open_pipeline(
    cfg: &config::Config,
    encoding: Option<FeatureVector>,
    liveness: Option<f32>,
) -> Result<AuthPipeline> {
    AuthPipeline::from_config(
        cfg,
        PrecomputedEncoding(encoding),
        SuppliedLiveness(liveness),
    )
    .with_context(|| format!("opening template store {}", cfg.store_file.display()))
}

fn open_store_only(cfg: &config::Config) -> Result<AuthPipeline> {
    open_pipeline(cfg, None, None)
}

fn enroll(cfg: &config::Config, name: &str, encoding: &Path) -> Result<()> {
    let encoding = read_encoding(encoding)?;
    info!(
        "Enrolling {} ({}-dimensional encoding)",
        name,
        encoding.dimension()
    );
    let pipeline = open_pipeline(cfg, Some(encoding), None)?;
    let record = pipeline
        .enroll(name, &read_region(None)?)
        .context("Failed to enroll face")?;
    info!("✓ Face enrolled for {} (id {})", record.name, record.id);
    Ok(())
}

fn verify(
    cfg: &config::Config,
    encoding: &Path,
    image: Option<&Path>,
    liveness: Option<f32>,
    json: bool,
) -> Result<()> {
    let encoding = read_encoding(encoding)?;
    let region = read_region(image)?;
    let pipeline = open_pipeline(cfg, Some(encoding), liveness)?;
    info!(
        "Matching against {} enrolled face(s), threshold {:.3}",
        pipeline.store().snapshot().len(),
        pipeline.threshold()
    );

    let (bbox, outcome) = pipeline
        .process_frame(std::slice::from_ref(&region))
        .pop()
        .context("pipeline returned no decision")?;
    let result = outcome.match_result();
    let state = match &outcome {
        RegionOutcome::Matched(_) => "matched",
        RegionOutcome::Unmatched(_) => "unmatched",
        RegionOutcome::Rejected => "rejected",
        RegionOutcome::NoEncoding => "no_encoding",
    };

    if json {
        let report = serde_json::json!({
            "bbox": bbox,
            "outcome": state,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(name) = &result.name {
        println!("{state}: {name} (distance {:.4})", result.distance);
    } else {
        println!("{state} (distance {:.4})", result.distance);
    }

    if !outcome.is_granted() {
        bail!("Authentication failed: {state}");
    }
    Ok(())
}

fn list(cfg: &config::Config) -> Result<()> {
    let pipeline = open_store_only(cfg)?;
    let snapshot = pipeline.store().snapshot();
    if snapshot.is_empty() {
        info!("No enrolled faces in {}", cfg.store_file.display());
        return Ok(());
    }
    for (index, record) in snapshot.records().iter().enumerate() {
        println!(
            "{:>3}  {}  {}  ({} values)",
            index,
            record.id,
            record.name,
            record.encoding.dimension()
        );
    }
    Ok(())
}

fn remove(cfg: &config::Config, id: Option<Uuid>, name: Option<&str>) -> Result<()> {
    let pipeline = open_store_only(cfg)?;
    match (id, name) {
        (Some(id), _) => {
            let record = pipeline.remove(id).context("Failed to remove face")?;
            info!("✓ Removed {} ({})", record.name, record.id);
        }
        (None, Some(name)) => {
            let count = pipeline
                .remove_by_name(name)
                .context("Failed to remove faces")?;
            if count == 0 {
                bail!("No enrolled faces named {name}");
            }
            info!("✓ Removed {count} face(s) for {name}");
        }
        (None, None) => bail!("pass --id or --name"),
    }
    Ok(())
}

fn purge(cfg: &config::Config) -> Result<()> {
    info!("Purging template store {}", cfg.store_file.display());
    let pipeline = open_store_only(cfg)?;
    pipeline
        .store()
        .purge()
        .context("Failed to purge template store")?;
    info!("✓ All enrolled faces purged");
    Ok(())
}

fn logs(cfg: &config::Config, tail: Option<usize>) -> Result<()> {
    let log = FileAuditLog::new(&cfg.audit_log);
    for line in log.read_lines(tail).context("Failed to read audit log")? {
        println!("{line}");
    }
    Ok(())
}

fn open_config(cfg: &config::Config, path: Option<&Path>) -> Result<()> {
    let config_path = path.unwrap_or(config::CONFIG_PATH.as_path());
    if !config_path.exists() {
        config::save_config(cfg, Some(config_path))?;
    }
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {}", config_path.display());

    let status = std::process::Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        bail!("Editor exited with non-zero status");
    }

    Ok(())
}
