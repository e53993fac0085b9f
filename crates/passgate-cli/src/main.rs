mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use passgate_core::{
    FaceOutcome, NotificationSink, ProfileStore, Session, SessionOutcome, TracingSink,
};
use passgate_io::{DescriptorSidecar, JsonlSink, ProfileDirectory, ReplayFeed};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "passgate", about = "Face-verified hall pass kiosk")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the pass types that can be requested
    Passes,
    /// List enrolled identities
    List,
    /// Enroll a new identity from a photo
    Enroll {
        #[arg(long)]
        first: String,
        #[arg(long)]
        last: String,
        /// Photo of the person, any format the image decoder understands
        #[arg(long)]
        photo: PathBuf,
        /// JSON file with the face detected in the photo (`{"faces": [...]}`)
        #[arg(long)]
        descriptors: PathBuf,
    },
    /// Remove an enrolled identity
    Remove {
        /// Profile ID (e.g. "jane_doe")
        id: String,
    },
    /// Request a pass and wait for a face match
    Pass {
        /// Pass type from the catalogue
        pass_type: String,
        /// Replay script standing in for the camera
        #[arg(long)]
        feed: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let directory = ProfileDirectory::new(&config.profile_dir);

    match cli.command {
        Commands::Passes => {
            for pass_type in &config.pass_types {
                println!("{pass_type}");
            }
        }
        Commands::List => {
            let store = ProfileStore::load(&directory, &directory).await;
            if let Some(reason) = store.degraded() {
                println!("Profile directory unavailable: {reason}");
            }
            if store.is_empty() {
                println!("No identities enrolled");
            }
            for profile in store.profiles() {
                println!("{:<24} {}", profile.id, profile.display_name);
            }
            for skipped in store.skipped() {
                println!("skipped {}: {}", skipped.id, skipped.reason);
            }
        }
        Commands::Enroll {
            first,
            last,
            photo,
            descriptors,
        } => {
            let raw = tokio::fs::read(&descriptors)
                .await
                .with_context(|| format!("reading {}", descriptors.display()))?;
            let sidecar: DescriptorSidecar = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", descriptors.display()))?;
            let id = directory.enroll(&first, &last, &photo, sidecar.faces).await?;
            println!("Enrolled {id}");
        }
        Commands::Remove { id } => {
            directory.remove(&id).await?;
            println!("Removed {id}");
        }
        Commands::Pass { pass_type, feed } => {
            run_pass(&config, &directory, &pass_type, &feed).await?;
        }
    }

    Ok(())
}

async fn run_pass(
    config: &Config,
    directory: &ProfileDirectory,
    requested: &str,
    feed_path: &std::path::Path,
) -> Result<()> {
    let Some(pass_type) = config.find_pass_type(requested) else {
        bail!(
            "unknown pass type {requested:?} (available: {})",
            config.pass_types.join(", ")
        );
    };

    let store = ProfileStore::load(directory, directory).await;
    let feed = Arc::new(ReplayFeed::from_path(feed_path).await?);
    let sink: Arc<dyn NotificationSink> = match &config.audit_log {
        Some(path) => Arc::new(JsonlSink::new(path)),
        None => Arc::new(TracingSink),
    };

    let mut session = Session::start(
        pass_type,
        &store,
        &*feed,
        Arc::clone(&feed) as Arc<dyn passgate_core::DescriptorExtractor>,
        sink,
        config.session_config(),
        print_frame,
    )
    .await?;

    println!("{pass_type} pass requested. Look at the camera (Ctrl-C to cancel)...");

    let outcome = session
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    match outcome {
        SessionOutcome::Granted(grant) => {
            let record = grant.record();
            println!(
                "Pass granted: {} / {} at {} (confidence {}%)",
                record.identity, record.pass_type, record.time, record.confidence
            );
        }
        SessionOutcome::Abandoned => println!("Pass request cancelled"),
    }
    Ok(())
}

fn print_frame(faces: &[FaceOutcome]) {
    if faces.is_empty() {
        return;
    }
    let rendered: Vec<String> = faces
        .iter()
        .map(|face| {
            let b = face.bounding_box;
            let label = match (&face.name, face.distance) {
                (Some(name), Some(d)) => format!("{name} ({d:.2})"),
                (Some(name), None) => name.clone(),
                _ => "Unknown".to_string(),
            };
            format!("{label} @ {:.0},{:.0} {:.0}x{:.0}", b.x, b.y, b.width, b.height)
        })
        .collect();
    println!("  {}", rendered.join(" | "));
}
