use crate::auth::TokenAuthenticator;
use crate::bootstrap::{Core, build_core, open_store};
use crate::config::{ServerConfig, StoreConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use zonehost_common::{PartitionId, PlayerId};
use zonehost_kernel::{ClientHandle, CoreInspector, CoreSummary, ServerMessage, TickStats};

const OBSERVER_TOKEN: &str = "observer";

/// Outcome of a headless run.
#[derive(Debug)]
pub struct SimulationReport {
    pub ticks: Vec<TickStats>,
    pub summary: CoreSummary,
    /// Tick messages the observer connection received.
    pub observed_ticks: usize,
}

/// Scripted input for bot `index` at `tick`.
fn bot_intent(index: usize, tick: u64, ticks: u64) -> serde_json::Value {
    if tick == 1 {
        json!({"action": "join"})
    } else if tick == ticks {
        json!({"action": "leave"})
    } else {
        let phase = (index as u64 + tick) % 4;
        let (dx, dy) = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)][phase as usize];
        json!({"action": "move", "dx": dx, "dy": dy})
    }
}

/// Run `ticks` ticks in memory with `bots` scripted players, stepping the
/// scheduler by hand while it is paused.
pub async fn run(config: &ServerConfig, ticks: u64, bots: usize) -> anyhow::Result<SimulationReport> {
    let zones = match config.store.zones() {
        [] => vec!["lobby".to_string()],
        zones => zones.to_vec(),
    };
    let zone = PartitionId::new(zones[0].as_str());
    let store = open_store(&StoreConfig::Memory { zones }).await?;
    let auth = TokenAuthenticator::default().with_token(OBSERVER_TOKEN, OBSERVER_TOKEN);
    let Core {
        scheduler,
        registry,
        intents,
        ..
    } = build_core(config, store, Arc::new(auth)).await;

    let (handle, mut observed) = ClientHandle::channel(config.client_queue);
    let observer = registry.authenticate(handle, OBSERVER_TOKEN).await?;
    registry.register(observer.clone());
    registry.subscribe(&observer.player_id, &zone);

    scheduler.start_paused()?;
    let mut stats = Vec::new();
    let mut observed_ticks = 0;
    for tick in 1..=ticks {
        for index in 0..bots {
            let bot = PlayerId::new(format!("bot-{index}"));
            intents.enqueue(zone.clone(), bot, bot_intent(index, tick, ticks));
        }
        match scheduler.step().await {
            Ok(tick_stats) => stats.push(tick_stats),
            Err(e) => {
                tracing::warn!(tick, error = %e, "simulated tick failed");
                continue;
            }
        }
        if next_tick(&mut observed, config.core.send_timeout()).await {
            observed_ticks += 1;
        }
    }
    let summary = CoreInspector::summary(&scheduler);
    scheduler.stop().await;
    registry.close_all();

    Ok(SimulationReport {
        ticks: stats,
        summary,
        observed_ticks,
    })
}

/// Wait for the observer's copy of the tick just processed.
async fn next_tick(observed: &mut mpsc::Receiver<ServerMessage>, wait: Duration) -> bool {
    loop {
        match tokio::time::timeout(wait, observed.recv()).await {
            Ok(Some(ServerMessage::Tick { .. })) => return true,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn arena_run_processes_every_bot_intent() {
        let config = ServerConfig {
            plugin: Some("arena".into()),
            ..ServerConfig::default()
        };
        let report = run(&config, 5, 3).await.unwrap();

        assert_eq!(report.ticks.len(), 5);
        let numbers: Vec<u64> = report.ticks.iter().map(|s| s.tick_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(report.ticks.iter().all(|s| s.intents_processed == 3));
        assert_eq!(report.summary.tick, 5);
        assert_eq!(report.summary.plugin.as_deref(), Some("arena"));
        assert_eq!(report.observed_ticks, 5);
    }

    #[tokio::test]
    async fn run_without_plugin_still_ticks() {
        let report = run(&ServerConfig::default(), 2, 1).await.unwrap();
        assert_eq!(report.summary.tick, 2);
        assert!(report.summary.plugin.is_none());
    }

    #[test]
    fn bots_join_move_and_leave() {
        assert_eq!(bot_intent(0, 1, 3)["action"], json!("join"));
        assert_eq!(bot_intent(0, 2, 3)["action"], json!("move"));
        assert_eq!(bot_intent(0, 3, 3)["action"], json!("leave"));
    }
}
