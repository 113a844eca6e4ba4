//! Classroom: offline cache tooling for the classroom client
//!
//! Subcommands:
//! - `inspect`: list cached collections in the on-device store
//! - `clear`: drop one class's cached collections
//! - `demo`: walk through offline writes, promotion and class switching
//!   against an in-memory remote

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classroom_sync::SyncConfig;

mod demo;
mod inspect;

#[derive(Parser)]
#[command(name = "classroom")]
#[command(about = "Offline cache tooling for the classroom client", long_about = None)]
struct Cli {
    /// Directory of the on-device store
    #[arg(long, env = "CLASSROOM_STORE_DIR", global = true)]
    store_dir: Option<PathBuf>,

    /// Key namespace inside the store
    #[arg(long, env = "CLASSROOM_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cached collections with item and local-only counts
    Inspect {
        /// Only show this class
        #[arg(long)]
        class: Option<String>,
    },

    /// Remove every cached collection of a class
    Clear {
        /// Class to clear
        #[arg(long)]
        class: String,

        /// Preview what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the offline-first walkthrough against in-memory stores
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "classroom=info,classroom_sync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.store_dir, cli.namespace)?;

    match cli.command {
        Commands::Inspect { class } => {
            inspect::run_inspect(&config, &store_dir(&config), class.as_deref()).await
        }
        Commands::Clear { class, dry_run } => {
            inspect::run_clear(&config, &store_dir(&config), &class, dry_run).await
        }
        Commands::Demo => demo::run(&config).await,
    }
}

fn load_config(
    path: Option<&Path>,
    store_dir: Option<PathBuf>,
    namespace: Option<String>,
) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
            SyncConfig::from_json(&raw)
                .map_err(|e| miette::miette!("invalid config {}: {}", path.display(), e))?
        }
        None => SyncConfig::default(),
    };

    if let Some(dir) = store_dir {
        config.store_dir = Some(dir);
    }
    if let Some(namespace) = namespace {
        config.namespace = namespace;
    }
    Ok(config)
}

fn store_dir(config: &SyncConfig) -> PathBuf {
    config.store_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("classroom")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"namespace": "school", "max_pending_mutations": 4}"#).unwrap();

        let config = load_config(Some(&path), Some(dir.path().to_path_buf()), None).unwrap();
        assert_eq!(config.namespace, "school");
        assert_eq!(config.max_pending_mutations, 4);
        assert_eq!(store_dir(&config), dir.path());

        let config = load_config(Some(&path), None, Some("other".into())).unwrap();
        assert_eq!(config.namespace, "other");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/classroom.json")), None, None).is_err());
    }
}
