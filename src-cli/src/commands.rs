use crate::state::{open_config, AppState};
use anyhow::Context;
use klapp_core::{Diff, MessageSnapshot};
use klapp_security::CredentialStore;
use klapp_sync::{MarkReadError, MarkReadOutcome, StoreChange};
use serde::Serialize;
use std::io::BufRead;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    email: &'a str,
    #[serde(flatten)]
    snapshot: &'a MessageSnapshot,
}

pub async fn run(state: &AppState) -> anyhow::Result<()> {
    let mut changes = state.engine.subscribe_changes();
    state.engine.start().await?;
    info!(
        config = %state.config_manager.config_path().display(),
        interval_secs = state.config.sync.poll_interval_secs,
        "watching KLAPP inbox; press ctrl-c to stop"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                info!("shutdown requested");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => log_change(&change),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "change log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    state.engine.stop().await?;
    Ok(())
}

pub async fn status(state: &AppState) -> anyhow::Result<()> {
    state.engine.refresh_now().await.context("poll KLAPP")?;
    let snapshot = state.engine.snapshot();
    let report = StatusReport {
        email: &state.config.account.email,
        snapshot: &snapshot,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn mark_read(state: &AppState, id: &str) -> anyhow::Result<()> {
    state.engine.refresh_now().await.context("poll KLAPP")?;

    match state.engine.mark_as_read(id).await {
        Ok(MarkReadOutcome::Confirmed) => println!("marked {id} as read"),
        Ok(MarkReadOutcome::AlreadyRead) => println!("{id} is already read"),
        Err(MarkReadError::NotFound(err)) => anyhow::bail!(err),
        Err(MarkReadError::RemoteWrite(err)) => {
            return Err(err).context("KLAPP did not record the read state");
        }
    }
    Ok(())
}

pub async fn mark_all_read(state: &AppState) -> anyhow::Result<()> {
    state.engine.refresh_now().await.context("poll KLAPP")?;

    let marked = state
        .engine
        .mark_all_read()
        .await
        .context("KLAPP did not record the read state")?;
    println!("marked {marked} message(s) as read");
    Ok(())
}

pub fn set_password(config_dir: Option<&Path>, email: Option<&str>) -> anyhow::Result<()> {
    let email = account_email(config_dir, email)?;

    let mut password = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut password)
        .context("read password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("no password given on stdin");
    }

    CredentialStore::default()
        .store_password(&email, password)
        .context("store password in keychain")?;
    println!("stored password for {email}");
    Ok(())
}

pub fn forget_password(config_dir: Option<&Path>, email: Option<&str>) -> anyhow::Result<()> {
    let email = account_email(config_dir, email)?;
    CredentialStore::default()
        .forget_password(&email)
        .context("remove password from keychain")?;
    println!("removed password for {email}");
    Ok(())
}

fn account_email(config_dir: Option<&Path>, email: Option<&str>) -> anyhow::Result<String> {
    if let Some(email) = email {
        return Ok(email.to_string());
    }
    let config = open_config(config_dir)?.load().context("load app config")?;
    Ok(config.account.email)
}

fn log_change(change: &StoreChange) {
    info!(
        unread = change.snapshot.unread_count,
        latest = change
            .snapshot
            .latest
            .as_ref()
            .map(|message| message.subject.as_str())
            .unwrap_or(""),
        "{}",
        describe(&change.diff)
    );
}

fn describe(diff: &Diff) -> String {
    let parts = [
        ("new", diff.added.len()),
        ("read state changed", diff.read_changed.len()),
        ("updated", diff.content_changed.len()),
        ("gone", diff.removed.len()),
        ("reverted", diff.reverted.len()),
    ];
    let described = parts
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(label, count)| format!("{count} {label}"))
        .collect::<Vec<_>>();

    if described.is_empty() {
        "no changes".to_string()
    } else {
        described.join(", ")
    }
}
