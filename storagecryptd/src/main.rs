use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use storagecrypt_core::StorageType;
use storagecryptd::accounts::StorageRegistry;
use storagecryptd::config::DaemonConfig;
use storagecryptd::crypto::KeyringKeyStore;
use storagecryptd::index::IndexStore;
use storagecryptd::sync::{Outcome, SyncReport};
use storagecryptd::{StorageCryptService, logging};

const USAGE: &str = "\
Usage: storagecryptd [COMMAND]

Commands:
  run                          Start the sync service (default)
  sync                         Run one full pass and exit
  import <parent-id> <path>... Copy local files under a folder and upload them
  authorize-url <provider>     Print the sign-in URL of a provider
  connect <provider> <code>    Connect an account with an authorization code

Providers: drive, disk, swift";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Sync,
    Import { parent_id: i64, paths: Vec<PathBuf> },
    AuthorizeUrl { provider: StorageType },
    Connect { provider: StorageType, code: String },
    Help,
}

fn parse_provider(value: Option<String>) -> anyhow::Result<StorageType> {
    let value = value.context("missing provider")?;
    match StorageType::parse(&value) {
        Some(StorageType::Unsynchronized) | None => anyhow::bail!("unknown provider: {value}"),
        Some(provider) => Ok(provider),
    }
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Run);
    };
    let mode = match command.as_str() {
        "run" => CliMode::Run,
        "sync" => CliMode::Sync,
        "--help" | "-h" | "help" => CliMode::Help,
        "import" => {
            let parent = args.next().context("missing parent id")?;
            let parent_id = parent
                .parse()
                .with_context(|| format!("invalid parent id: {parent}"))?;
            let paths: Vec<PathBuf> = args.by_ref().map(PathBuf::from).collect();
            if paths.is_empty() {
                anyhow::bail!("nothing to import");
            }
            CliMode::Import { parent_id, paths }
        }
        "authorize-url" => CliMode::AuthorizeUrl {
            provider: parse_provider(args.next())?,
        },
        "connect" => {
            let provider = parse_provider(args.next())?;
            let code = args.next().context("missing authorization code")?;
            CliMode::Connect { provider, code }
        }
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }
    logging::init();

    let config = DaemonConfig::from_env().context("failed to read configuration")?;
    let index = IndexStore::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open index at {}", config.database_path.display()))?;
    let storages =
        StorageRegistry::from_keys(&config.providers).context("failed to set up providers")?;
    let service = StorageCryptService::new(
        config,
        index.clone(),
        storages,
        Arc::new(KeyringKeyStore::default()),
    );

    let result = run_mode(&service, mode).await;
    service.stop().await;
    index.close().await;
    result
}

async fn run_mode(service: &StorageCryptService, mode: CliMode) -> anyhow::Result<()> {
    match mode {
        CliMode::Help => Ok(()),
        CliMode::AuthorizeUrl { provider } => {
            let url = service.authorize_url(provider, None)?;
            println!("{url}");
            Ok(())
        }
        CliMode::Connect { provider, code } => {
            service.start().await?;
            let account = service
                .connect_account(provider, &code)
                .await
                .context("failed to connect account")?;
            println!("connected {} account {}", provider.as_str(), account.account_name);
            service.drain().await;
            Ok(())
        }
        CliMode::Import { parent_id, paths } => {
            service.start().await?;
            let ids = service
                .import_documents(parent_id, &paths)
                .await
                .context("import failed")?;
            println!("imported {} entries", ids.len());
            report(service.drain().await)
        }
        CliMode::Sync => {
            service.start().await?;
            service.sync_all().await?;
            report(service.drain().await)
        }
        CliMode::Run => {
            service.start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("failed waiting for shutdown signal")?;
            tracing::info!("shutdown requested");
            Ok(())
        }
    }
}

/// Prints the run summary and, for scripts, the full report as JSON.
fn report(report: Option<SyncReport>) -> anyhow::Result<()> {
    let Some(report) = report else {
        println!("nothing to do");
        return Ok(());
    };
    eprintln!("{}", report.summary());
    for failure in report.failures() {
        if let Outcome::Failed { reason, message } = &failure.outcome {
            eprintln!(
                "  {} ({}): {reason}: {message}",
                failure.display_name,
                failure.action.as_str()
            );
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
