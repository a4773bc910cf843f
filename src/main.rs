//! Matchlink Demo Client
//!
//! Connects to the configured backend and logs every status change until
//! Ctrl-C. With `MATCHLINK_AUTOPLAY=1` it also joins the matchmaker and
//! plays random picks.
//!
//! Settings come from the TOML file given as the first argument, or from
//! `MATCHLINK_*` environment variables.

use anyhow::Context;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use matchlink::{ConnectionStatus, MatchEvent, MatchmakeOutcome, NetworkService, Settings, VERSION};

const PICKS: [&str; 3] = ["rock", "paper", "scissors"];

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Matchlink client v{}", VERSION);

    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::from_toml_file(&path).with_context(|| format!("loading {}", path))?,
        None => Settings::from_env().context("loading settings from environment")?,
    };
    let autoplay = std::env::var("MATCHLINK_AUTOPLAY").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

    let runtime = if settings.use_main_thread_dispatch {
        tokio::runtime::Builder::new_current_thread()
    } else {
        tokio::runtime::Builder::new_multi_thread()
    }
    .enable_all()
    .build()
    .context("building runtime")?;

    runtime.block_on(run(settings, autoplay))
}

async fn run(settings: Settings, autoplay: bool) -> anyhow::Result<()> {
    info!(
        backend = ?settings.backend,
        endpoint = %settings.http_base_url(),
        main_thread = settings.use_main_thread_dispatch,
        "starting"
    );

    let service = Arc::new(NetworkService::new(settings).context("resolving device id")?);
    let mut status = service.subscribe_status();
    let mut matches = service.subscribe_matches();

    service.start().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
            change = status.recv() => {
                let Some(change) = change else { break };
                match &change.error_code {
                    Some(code) => info!(status = %change.status, code = %code, "status"),
                    None => info!(status = %change.status, "status"),
                }
                if autoplay && change.status == ConnectionStatus::Connected {
                    matchmake(&service).await;
                }
            }
            event = matches.recv() => {
                let Some(event) = event else { break };
                on_match_event(&service, event, autoplay).await;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn matchmake(service: &NetworkService) {
    match service.matchmake().await {
        Ok(MatchmakeOutcome::Queued(ticket)) => info!(ticket = %ticket, "searching for an opponent"),
        Ok(MatchmakeOutcome::AlreadyActive) => {}
        Err(e) => warn!("matchmaking failed: {}", e),
    }
}

async fn on_match_event(service: &NetworkService, event: MatchEvent, autoplay: bool) {
    match event {
        MatchEvent::MatchReady(ready) => {
            info!(
                match_id = %ready.match_id,
                opponent = ready.opponent_username.as_deref().unwrap_or("unknown"),
                round = ready.round,
                "match ready"
            );
        }
        MatchEvent::RoundResolved(resolved) => {
            info!(
                round = resolved.round,
                winner = resolved.winner_user_id.as_deref().unwrap_or("draw"),
                scores = ?resolved.scores,
                "round resolved"
            );
        }
    }

    if autoplay {
        let pick = PICKS.choose(&mut rand::thread_rng()).copied().unwrap_or("rock");
        if let Err(e) = service.send_pick(pick).await {
            warn!("pick failed: {}", e);
        } else {
            info!(pick, "picked");
        }
    }
}
