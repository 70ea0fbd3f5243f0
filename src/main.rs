use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_scout::clock::{Clock, SystemClock};
use parking_scout::models::BoundingBox;
use parking_scout::notify::{LogSink, NotificationSink};
use parking_scout::persistence::{self, JsonFileStore, KeyValueStore};
use parking_scout::remote::traits::{PositionSource, ReportApi, ReportFeed, RoadVerifier};
use parking_scout::remote::{
    HttpReportService, MemoryReportService, OverpassRoadVerifier, ReplayPositionSource,
};
use parking_scout::{Collaborators, Config, Driver, NewSpot, Session, UserAction};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🅿️  Parking Scout");
    info!("================");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(Path::new(&path)).await?,
        None => Config::default(),
    };
    let identity = config
        .identity
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sink: Arc<dyn NotificationSink> = Arc::new(LogSink);
    let kv: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&config.storage_path));

    let (api, feed) = match &config.remote.base_url {
        Some(url) => {
            info!("Using report server at {}", url);
            let service = Arc::new(HttpReportService::new(
                url,
                Duration::from_secs(config.remote.timeout_secs),
                Duration::from_millis(config.remote.poll_interval_ms),
            )?);
            let api: Arc<dyn ReportApi> = service.clone();
            let feed: Arc<dyn ReportFeed> = service;
            (api, feed)
        }
        None => {
            info!("No report server configured, keeping reports in memory");
            let service = Arc::new(MemoryReportService::new(clock.clone()));
            let api: Arc<dyn ReportApi> = service.clone();
            let feed: Arc<dyn ReportFeed> = service;
            (api, feed)
        }
    };

    let positions = match &config.positions_path {
        Some(path) => {
            let source: Arc<dyn PositionSource> =
                Arc::new(ReplayPositionSource::from_file(path).await?);
            Some(source)
        }
        None => None,
    };

    let verifier = if config.road_check.enabled {
        let verifier: Arc<dyn RoadVerifier> = Arc::new(OverpassRoadVerifier::new(
            &config.road_check.endpoint,
            config.road_check.radius_m,
            Duration::from_secs(config.road_check.timeout_secs),
        )?);
        Some(verifier)
    } else {
        None
    };

    let mut session = Session::new(&identity, &config, clock.clone(), sink.clone());
    let saved = persistence::load(kv.as_ref(), clock.now())
        .await
        .context("Failed to load saved spots")?;
    session.restore(saved);

    let collab = Collaborators {
        api,
        feed,
        kv,
        sink,
        positions,
        verifier,
    };
    let driver = Driver::new(session, collab, Duration::from_millis(config.tick_interval_ms));

    let (tx, rx) = mpsc::channel(16);
    let input = tokio::spawn(read_commands(tx));

    info!(
        "Commands: report <lat> <lon> <secs> [rate], delete <id>, claim <id>, undo, \
         view <w> <s> <e> <n>, list, quit"
    );
    let state = driver.run(rx).await?;
    input.abort();

    info!("💾 Saved {} spots to {}", state.spots.len(), config.storage_path.display());
    Ok(())
}

async fn read_commands(tx: mpsc::Sender<UserAction>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(action) => {
                let quit = matches!(action, UserAction::Shutdown);
                if tx.send(action).await.is_err() || quit {
                    return;
                }
            }
            Err(e) => warn!("{:#}", e),
        }
    }
    let _ = tx.send(UserAction::Shutdown).await;
}

fn parse_command(line: &str) -> Result<UserAction> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let number = |i: usize| -> Result<f64> {
        let raw = parts.get(i).context("Missing argument")?;
        raw.parse::<f64>()
            .with_context(|| format!("Not a number: {raw}"))
    };

    let action = match parts.first().copied() {
        Some("report") => {
            let latitude = number(1)?;
            let longitude = number(2)?;
            let secs = parts
                .get(3)
                .context("Missing duration")?
                .parse::<i64>()
                .context("Duration must be whole seconds")?;
            match parts.get(4..).filter(|rest| !rest.is_empty()) {
                Some(rate) => {
                    let rate = rate.join(" ");
                    UserAction::Report(NewSpot::paid(latitude, longitude, &rate, secs))
                }
                None => UserAction::Report(NewSpot::free(latitude, longitude, secs)),
            }
        }
        Some("delete") => UserAction::Delete(parts.get(1).context("Missing id")?.to_string()),
        Some("claim") => UserAction::Claim(parts.get(1).context("Missing id")?.to_string()),
        Some("undo") => UserAction::Undo,
        Some("view") => UserAction::ViewportChanged(BoundingBox::new(
            number(1)?,
            number(2)?,
            number(3)?,
            number(4)?,
        )),
        Some("list") => UserAction::Show,
        Some("quit") | Some("exit") => UserAction::Shutdown,
        _ => anyhow::bail!("Unknown command: {line}"),
    };
    Ok(action)
}
