//! Administrative CLI: loads DDF packages into the relational store and
//! manages dataset versions.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ddf_serve::config::Config;
use ddf_serve::services::assets::create_store;
use ddf_serve::services::catalog::{Catalog, RemoveSelector};
use ddf_serve::services::loader::{LoadOptions, Loader};
use ddf_serve::storage::MySqlStorage;

#[derive(Debug, Parser)]
#[command(name = "ddf-admin")]
#[command(author, version, about = "Dataset administration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load a DDF package directory as a dataset version.
    Load {
        /// Package directory.
        #[arg(short = 'd', long = "dir", default_value = ".")]
        dir: PathBuf,
        /// Mark the loaded version as the default.
        #[arg(long)]
        publish: bool,
        /// Derive the table plan without touching the database.
        #[arg(long)]
        only_parse: bool,
        /// Upload the assets directory only.
        #[arg(short = 'a', long)]
        assets_only: bool,
        /// Protect the version with a password.
        #[arg(long)]
        password: Option<String>,
        /// Dataset name.
        name: String,
        /// Version; derived from the date when omitted.
        version: Option<String>,
    },
    /// List datasets and their versions.
    List {
        name: Option<String>,
    },
    /// Delete a version, a comma-separated list, or `_ALL_`.
    Delete {
        name: String,
        version: String,
    },
    /// Set the default version, or `latest` to track the newest import.
    MakeDefault {
        name: String,
        version: String,
    },
    /// Drop old versions, keeping the default and its predecessor.
    Purge {
        name: String,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;
    let storage = MySqlStorage::new(&config.database);
    storage.migrate().await?;
    let catalog = Catalog::new(storage.clone());

    match cli.command {
        Commands::Load {
            dir,
            publish,
            only_parse,
            assets_only,
            password,
            name,
            version,
        } => {
            let assets = create_store(&config.assets)?;
            let loader = Loader::new(storage, catalog, assets, &config);
            let options = LoadOptions {
                publish,
                only_parse,
                assets_only,
                password,
            };
            let version = loader
                .load(&dir, &name, version.as_deref(), &options)
                .await?;
            if only_parse {
                println!("Parsed {name} (version would be {version})");
            } else {
                println!("Loaded {name}/{version}");
            }
        }
        Commands::List { name } => {
            let mut entries = catalog.list(name.as_deref()).await?;
            entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.imported.cmp(&b.imported)));
            for entry in entries {
                let default = if entry.is_default { " default" } else { "" };
                println!(
                    "{} {}{} {}",
                    entry.name,
                    entry.version,
                    default,
                    entry.imported.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Delete { name, version } => {
            let selector = RemoveSelector::parse(&version);
            let tables = catalog.remove(&name, &selector).await?;
            println!("Removed {} table(s) of {name}", tables.len());
        }
        Commands::MakeDefault { name, version } => {
            catalog.mark_default(&name, &version).await?;
            println!("Default of {name} is now {version}");
        }
        Commands::Purge { name } => {
            let tables = catalog.purge(&name).await?;
            println!("Purged {} table(s) of {name}", tables.len());
        }
    }
    Ok(())
}
