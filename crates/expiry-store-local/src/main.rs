use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use expiry_store_core::{codec, LockManager, Owner, Record, RecordId};
use expiry_store_local::config::{Command, Config};
use expiry_store_local::lock::FileLock;
use expiry_store_local::storage::{read_document, DurableWriter};
use expiry_store_local::{Store, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let store_config = config.store_config();

    info!("Document: {}", store_config.document_path.display());
    info!("  Backups: {}", store_config.backup_dir.display());
    info!("  Lock: {} (scope {})", store_config.lock_path.display(), store_config.lock_scope);

    match &config.command {
        Command::Summary => {
            let (summary, recovered_from) = Store::read_summary(store_config).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if let Some(backup) = recovered_from {
                warn!("Primary was corrupt, recovered from {}", backup.display());
            }
        }
        Command::Verify => verify(&store_config).await?,
        Command::Backups => {
            let writer = DurableWriter::new(
                &store_config.document_path,
                &store_config.backup_dir,
                store_config.retention,
            );
            for backup in writer.list_backups().await? {
                println!(
                    "{}  {:>10} bytes  {}",
                    backup.taken_at.to_rfc3339(),
                    backup.size_bytes,
                    backup.path.display()
                );
            }
        }
        Command::Restore { backup } => {
            let (source, document) =
                Store::restore(&store_config, Owner::current(), backup.as_deref()).await?;
            println!(
                "Restored {} records from {}",
                document.len(),
                source.display()
            );
        }
        Command::LockStatus => {
            let lock = FileLock::new(
                &store_config.lock_path,
                Owner::current(),
                store_config.stale_after,
            );
            match lock.inspect().await? {
                Some(token) => {
                    let stale = lock.is_stale(&token).await;
                    println!(
                        "Held by {} on {} (pid {}) for {:?}{}",
                        token.owner,
                        token.host,
                        token.pid,
                        token.age(Utc::now()),
                        if stale { ", stale" } else { "" }
                    )
                }
                None => println!("Not held"),
            }
        }
        Command::Mark {
            image,
            index,
            date,
            raw,
            illegible,
            skip,
            geometry,
        } => {
            let geometry = match geometry {
                Some(json) => serde_json::from_str(json)?,
                None => serde_json::Value::Null,
            };
            let record = Record::pending(RecordId::for_region(image, *index), geometry);
            let record = match (date, *illegible, *skip) {
                (Some(date), _, _) => record.with_date(*date, raw.clone().unwrap_or_default()),
                (None, true, _) => record.illegible(raw.clone()),
                (None, false, true) => record.skipped(),
                (None, false, false) => record,
            };
            edit(store_config, |store| store.upsert(record).map(|_| ())).await?;
        }
        Command::Revert { id } => {
            let id = RecordId::new(id.as_str());
            edit(store_config, |store| {
                if !store.revert(&id)? {
                    warn!("Nothing to revert for {}", id);
                }
                Ok(())
            })
            .await?;
        }
    }

    Ok(())
}

/// One-shot session: open, apply `change`, close.
async fn edit<F>(config: StoreConfig, change: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut Store) -> Result<(), expiry_store_core::StoreError>,
{
    let mut store = match Store::open(config).await {
        Ok(store) => store,
        Err(e) if e.is_retryable() => {
            warn!("Document is busy or unavailable, try again later");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    info!("Editing as {}", store.owner());
    if let Err(e) = change(&mut store) {
        store.close().await?;
        return Err(e.into());
    }
    if let Some(outcome) = store.close().await? {
        for (id, note) in &outcome.conflicts {
            warn!(
                "Conflict on {}: {} by {} was superseded",
                id,
                note.status.as_str(),
                note.annotator
            );
        }
        println!(
            "Committed ({} records, written: {})",
            outcome.records, outcome.written
        );
    }
    Ok(())
}

/// Decode the primary without taking the lock.
async fn verify(config: &StoreConfig) -> anyhow::Result<()> {
    let Some(bytes) = read_document(
        &config.document_path,
        config.io_retries,
        config.io_retry_delay,
    )
    .await?
    else {
        anyhow::bail!("{} does not exist", config.document_path.display());
    };

    let document = codec::decode(&bytes)?;
    let summary = document.summary();
    println!(
        "OK: {} records ({} dated, {} illegible, {} skipped, {} pending, {} conflicted)",
        summary.total,
        summary.dated,
        summary.illegible,
        summary.skipped,
        summary.pending,
        summary.conflicted
    );
    Ok(())
}
