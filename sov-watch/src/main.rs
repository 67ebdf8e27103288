//! Follows the public campaign feed and, optionally, one session lobby.
//!
//! Environment:
//! - `SOV_API_BASE_URL` / `SOV_API_URL`: server base URL
//! - `SOV_TOKEN`: bearer token
//! - `SOV_SESSION_ID`: session to open (needs a token)
//! - `SOV_CHARACTER_ID`: local character, for role and kick detection
//! - `RUST_LOG`: log filter

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use sov_sync::{
    ApiClient, AuthTokenBridge, CampaignFeed, ClientConfig, ConnectionManager, LobbyNotice,
    LobbyService,
};
use tokio::sync::mpsc;

fn env_i64(name: &str) -> Result<Option<i64>, Box<dyn Error>> {
    match std::env::var(name) {
        Ok(raw) => Ok(Some(
            raw.trim()
                .parse()
                .map_err(|_| format!("{name} must be an integer"))?,
        )),
        Err(_) => Ok(None),
    }
}

async fn next_notice(rx: &mut Option<mpsc::UnboundedReceiver<LobbyNotice>>) -> Option<LobbyNotice> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = ClientConfig::from_env()?;
    let token = std::env::var("SOV_TOKEN").ok();
    let session_id = env_i64("SOV_SESSION_ID")?;
    let character_id = env_i64("SOV_CHARACTER_ID")?;

    info!("Connecting to {}", config.ws_url());
    let manager = ConnectionManager::new(config.clone());
    let conn = manager.handle();
    let api = Arc::new(ApiClient::new(config.clone())?);

    let auth = AuthTokenBridge::new(conn.clone()).with_api(Arc::clone(&api));
    auth.update(token);

    let feed = CampaignFeed::attach(&conn, config.catchup.clone(), Duration::from_secs(1));
    let mut feed_changes = feed.changes();
    let mut states = conn.state_changes();
    manager.start();

    let mut lobby = None;
    let mut notices = None;
    if let Some(id) = session_id {
        let (service, rx) = LobbyService::new(
            Arc::clone(&api),
            &conn,
            character_id,
            config.open_retry_interval,
        );
        let opened = tokio::select! {
            opened = service.open_with_retry(id) => opened,
            _ = tokio::signal::ctrl_c() => {
                manager.stop().await;
                return Ok(());
            }
        };
        match opened {
            Ok(()) => {
                if let Some(state) = service.state() {
                    info!(
                        "Session {id}: {} members ({} online), role {:?}",
                        state.members.len(),
                        state.online_count(),
                        state.my_role
                    );
                }
                lobby = Some(service);
                notices = Some(rx);
            }
            Err(e) => error!("Cannot open session {id}: {e}"),
        }
    }

    loop {
        tokio::select! {
            changed = feed_changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = feed_changes.borrow_and_update().clone();
                info!(
                    "Campaigns v{}: {} active{}",
                    status.version,
                    status.count,
                    if status.stale { " (stale)" } else { "" }
                );
                let now = Utc::now();
                for campaign in feed.campaigns().iter().take(5) {
                    info!(
                        "  {:<12} def {:>3}%  {}",
                        campaign.system_name.as_deref().unwrap_or("?"),
                        campaign.defender_pct(),
                        campaign.countdown(now).unwrap_or_default()
                    );
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Connection {:?}", *states.borrow_and_update());
            }
            notice = next_notice(&mut notices) => match notice {
                Some(notice) => {
                    info!("Lobby: {notice:?}");
                    if lobby.as_ref().is_some_and(|l| l.session_id().is_none()) {
                        warn!("Session closed");
                    }
                }
                None => notices = None,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(lobby);
    drop(feed);
    let stats = conn.stats();
    info!(
        "Shutting down: {} received, {} ignored, {} sent, {} reconnects",
        stats.messages_received, stats.frames_ignored, stats.messages_sent, stats.reconnects
    );
    manager.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        error!("{e}");
        std::process::exit(1);
    }
}
