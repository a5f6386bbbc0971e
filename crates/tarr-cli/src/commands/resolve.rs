use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::Serialize;
use tarr_core::DirectoryEntry;
use tokio_util::sync::CancellationToken;

use super::Session;
use crate::ui;

#[derive(Serialize)]
struct Resolved {
    team_id: String,
    channel_id: Option<String>,
}

pub async fn run(
    config: Option<PathBuf>,
    cancel: CancellationToken,
    team: Option<String>,
    channel: Option<String>,
    list: bool,
    json: bool,
) -> Result<()> {
    let session = Session::open(config, cancel)?;
    let resolver = session.resolver();
    let team_name = team.unwrap_or_else(|| session.config.target.team_name.clone());
    let channel_name = channel.unwrap_or_else(|| session.config.target.channel_name.clone());

    if list && team_name.trim().is_empty() {
        let teams = resolver.list_teams().await?;
        return print_entries("Joined teams", &teams, json);
    }

    if team_name.trim().is_empty() {
        bail!("Pass --team or set target.team_name");
    }
    let Some(team_id) = resolver.resolve_team_id(&team_name).await? else {
        bail!("No joined team named '{}'", team_name.trim());
    };

    if list {
        let channels = resolver.list_channels(&team_id).await?;
        return print_entries(&format!("Channels in {}", team_name.trim()), &channels, json);
    }

    let channel_id = if channel_name.trim().is_empty() {
        None
    } else {
        match resolver.resolve_channel_id(&team_id, &channel_name).await? {
            Some(id) => Some(id),
            None => bail!("Team '{}' has no channel named '{}'", team_name.trim(), channel_name.trim()),
        }
    };

    if json {
        let resolved = Resolved { team_id, channel_id };
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    ui::success(&format!("Team {}: {}", team_name.trim(), team_id));
    if let Some(channel_id) = channel_id {
        ui::success(&format!("Channel {}: {}", channel_name.trim(), channel_id));
    }
    Ok(())
}

fn print_entries(title: &str, entries: &[DirectoryEntry], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    println!();
    println!("  {title}");
    println!();
    for entry in entries {
        ui::info(&format!("{:<40} {}", entry.display_name, entry.id));
    }
    println!();
    Ok(())
}
