use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use super::Session;
use crate::ui;

pub async fn run(config: Option<PathBuf>, cancel: CancellationToken) -> Result<()> {
    let session = Session::open(config, cancel)?;
    let cached = session.broker.has_cached_credential().await;

    let login = session.broker.acquire();
    tokio::select! {
        _ = session.cancel.cancelled() => anyhow::bail!("Login cancelled"),
        token = login => {
            token.context("Sign-in failed")?;
        }
    }

    if cached {
        ui::success("Signed in with the cached credential.");
    } else {
        ui::success("Signed in.");
    }
    ui::info(&format!(
        "Credential cache: {}",
        session.broker.store().path().display()
    ));
    Ok(())
}
