use std::path::PathBuf;

use anyhow::Result;
use tarr_core::BotDiscovery;
use tokio_util::sync::CancellationToken;

use super::Session;
use crate::ui;

pub async fn run(config: Option<PathBuf>, cancel: CancellationToken, limit: usize, json: bool) -> Result<()> {
    let session = Session::open(config, cancel)?;
    let (team_id, channel_id) = session.target_ids().await?;

    let discovery = BotDiscovery::new(session.client.clone(), session.endpoints.clone());
    let spinner = (!json).then(|| ui::spinner("Scanning recent channel traffic"));
    let result = discovery.discover(&team_id, &channel_id, limit).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let found = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }

    if found.is_empty() {
        ui::error("No application senders in recent messages for this channel.");
        ui::info("If the bot has never posted here, trigger it once in Teams and rerun.");
        return Ok(());
    }

    let configured = session.config.bot.display_name.trim().to_lowercase();
    println!();
    println!("  Application senders in this channel:");
    println!();
    for bot in &found {
        let mark = if !configured.is_empty() && bot.display_name.trim().to_lowercase() == configured {
            "  <- bot.display_name"
        } else {
            ""
        };
        ui::info(&format!(
            "{:<38} {:<30} {:>4} msg{mark}",
            bot.app_id, bot.display_name, bot.messages_seen
        ));
    }
    println!();
    ui::info("Put the id in bot.app_id (or TARR_BOT_APP_ID) for exact matching.");
    Ok(())
}
