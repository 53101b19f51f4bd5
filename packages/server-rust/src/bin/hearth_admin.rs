//! hearth-admin: inspect and migrate persisted homes without a running server.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use hearth_core::{Home, NameResolver, NoNameResolver, OfflineNameResolver, OwnerId};
use hearth_server::storage::{open_storage, BackendConfig, SqliteConfig, YamlConfig};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "hearth-admin", version)]
#[command(about = "Inspect and migrate persisted homes")]
struct Cli {
    /// Directory holding homes.yml and homes.db
    #[arg(short, long, global = true, env = "HEARTH_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Resolve legacy name-keyed records to offline-mode UUIDs
    #[arg(long, global = true, env = "HEARTH_OFFLINE_NAMES")]
    offline_names: bool,

    /// Log as JSON instead of plain text
    #[arg(long, global = true, env = "HEARTH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Yaml,
    Sqlite,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every home as one JSON object per line
    Dump {
        #[arg(short, long, value_enum, default_value_t = BackendKind::Yaml)]
        backend: BackendKind,
    },

    /// Copy every home from one backend into another
    Migrate {
        #[arg(long, value_enum)]
        from: BackendKind,
        #[arg(long, value_enum)]
        to: BackendKind,
    },
}

#[derive(Serialize)]
struct DumpLine<'a> {
    owner: OwnerId,
    #[serde(flatten)]
    home: &'a Home,
}

fn backend_config(kind: BackendKind, data_dir: &Path) -> BackendConfig {
    match kind {
        BackendKind::Yaml => BackendConfig::Yaml(YamlConfig {
            data_dir: data_dir.to_path_buf(),
            ..YamlConfig::default()
        }),
        BackendKind::Sqlite => BackendConfig::Sqlite(SqliteConfig {
            data_dir: data_dir.to_path_buf(),
            ..SqliteConfig::default()
        }),
    }
}

async fn dump(config: &BackendConfig, names: Arc<dyn NameResolver>) -> anyhow::Result<()> {
    let storage = open_storage(config, names).await?;
    let homes = storage.load_all().await.context("loading homes")?;
    storage.close().await?;

    let mut owners: Vec<&OwnerId> = homes.keys().collect();
    owners.sort();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for owner in owners {
        let line = DumpLine {
            owner: *owner,
            home: &homes[owner],
        };
        serde_json::to_writer(&mut out, &line)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

async fn migrate(
    from: &BackendConfig,
    to: &BackendConfig,
    names: Arc<dyn NameResolver>,
) -> anyhow::Result<()> {
    let source = open_storage(from, Arc::clone(&names)).await?;
    let target = open_storage(to, names).await?;

    let homes = source.load_all().await.context("loading source homes")?;
    target
        .save_all(&homes)
        .await
        .context("writing target homes")?;
    info!(
        from = source.name(),
        to = target.name(),
        count = homes.len(),
        "Migrated homes"
    );

    source.close().await?;
    target.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    hearth_server::logging::init(cli.log_json)
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    let names: Arc<dyn NameResolver> = if cli.offline_names {
        Arc::new(OfflineNameResolver)
    } else {
        Arc::new(NoNameResolver)
    };

    match cli.command {
        Command::Dump { backend } => dump(&backend_config(backend, &cli.data_dir), names).await,
        Command::Migrate { from, to } => {
            if from == to {
                bail!("source and target backend are both {from:?}");
            }
            migrate(
                &backend_config(from, &cli.data_dir),
                &backend_config(to, &cli.data_dir),
                names,
            )
            .await
        }
    }
}
