use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use profilestore::{
    LoadParams, MockRemoteStore, StoreConfig, StoreError, StoreManager, reconcile_template,
};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "profile-tool")]
#[command(about = "Developer tooling for session-locked profile stores")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Race several simulated processes for the same profile on a mock store
    Simulate {
        #[arg(long, default_value = "Player_1")]
        key: String,
        #[arg(long, default_value_t = 3)]
        contenders: usize,
        #[arg(long, default_value_t = 200)]
        heartbeat_ms: u64,
        /// Let the winner's lock go stale and have a contender take it over
        #[arg(long)]
        takeover: bool,
    },
    /// Merge a template JSON object into a data JSON object
    Reconcile {
        #[arg(long)]
        template: PathBuf,
        #[arg(long)]
        data: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            key,
            contenders,
            heartbeat_ms,
            takeover,
        } => simulate(&key, contenders.max(1), heartbeat_ms.max(1), takeover).await,
        Command::Reconcile { template, data } => reconcile_files(&template, &data),
    }
}

async fn simulate(key: &str, contenders: usize, heartbeat_ms: u64, takeover: bool) -> Result<()> {
    let remote = MockRemoteStore::new().with_latency(Duration::from_millis(5));
    let heartbeat = Duration::from_millis(heartbeat_ms);
    let template = json!({"coins": 0, "inventory": {}});

    let mut managers = Vec::with_capacity(contenders);
    for index in 0..contenders {
        let config = StoreConfig::new()
            .heartbeat_interval(heartbeat)
            .stale_after(heartbeat * 3)
            .holder(format!("server-{}", index));
        let manager = StoreManager::new(Arc::new(remote.clone()), config)?;
        manager.create("Players", template.clone()).await?;
        managers.push(manager);
    }

    let loads = managers
        .iter()
        .map(|manager| {
            let store = manager.store("Players").ok_or_else(|| anyhow!("store missing"))?;
            Ok(store.load_profile_async(key, LoadParams::new()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut winner = None;
    for (index, load) in loads.into_iter().enumerate() {
        match load.await {
            Ok(profile) => {
                println!("server-{} acquired '{}'", index, key);
                winner = Some((index, profile));
            }
            Err(StoreError::SessionLocked { holder, .. }) => {
                println!("server-{} locked out (held by {})", index, holder);
            }
            Err(err) => println!("server-{} failed: {}", index, err),
        }
    }

    let Some((winner_index, profile)) = winner else {
        return Err(anyhow!("no contender acquired '{}'", key));
    };
    profile.set("coins", json!(100))?;
    profile.save().await?;

    if takeover && contenders > 1 {
        let challenger = (winner_index + 1) % contenders;
        // Skew the service clock so the winner's last renewal looks stale.
        remote.advance_clock(heartbeat * 4);
        let store = managers[challenger]
            .store("Players")
            .ok_or_else(|| anyhow!("store missing"))?;
        let stolen = store.load_profile_async(key, LoadParams::new()).await?;
        println!("server-{} took over stale session", challenger);

        let reason = tokio::time::timeout(heartbeat * 5, profile.session_ended())
            .await
            .context("winner never noticed the takeover")?;
        println!("server-{} session ended: {}", winner_index, reason);
        stolen.end_session().await?;
    }

    for manager in &managers {
        for report in manager.shutdown().await {
            println!(
                "drained '{}': released={:?} failed={} abandoned={:?}",
                report.store,
                report.released,
                report.failed.len(),
                report.abandoned
            );
        }
    }
    println!("final record: {}", remote.raw(&format!("Players/{}", key)).unwrap_or(Value::Null));
    Ok(())
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse '{}'", path.display()))?;
    match value {
        Value::Object(fields) => Ok(fields),
        _ => Err(anyhow!("'{}' must contain a JSON object", path.display())),
    }
}

fn reconcile_files(template: &Path, data: &Path) -> Result<()> {
    let template = read_object(template)?;
    let mut data = read_object(data)?;
    let changed = reconcile_template(&mut data, &template);
    println!("{}", serde_json::to_string_pretty(&Value::Object(data))?);
    eprintln!("changed: {}", changed);
    Ok(())
}
