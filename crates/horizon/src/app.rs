//! Main application logic and lifecycle management.
//!
//! The `Application` loads configuration, builds the simulation, runs the
//! fixed-rate tick loop on its own task and coordinates shutdown.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    shutdown::ShutdownState,
    signals::{setup_signal_handlers, setup_signal_handlers_silent},
    simulation::Simulation,
};
use horizon_repgraph::GraphStats;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Main application struct.
///
/// Owns the validated configuration until `run` hands it to the tick loop.
pub struct Application {
    config: AppConfig,
}

impl Application {
    /// Loads the configuration file, applies CLI overrides and validates the
    /// result.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        args.apply_to(&mut config);

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();
        Ok(Self { config })
    }

    pub fn from_config(config: AppConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs until a termination signal arrives.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Horizon replication host");
        self.log_configuration_summary();

        let simulation = Simulation::new(&self.config)?;
        let shutdown_state = ShutdownState::new();
        let (stats_tx, stats_rx) = watch::channel(GraphStats::default());

        let tick_handle = tokio::spawn(run_tick_loop(
            simulation,
            self.config.replication.general.server_tick_rate,
            shutdown_state.clone(),
            stats_tx,
        ));

        let monitoring_handle = {
            let stats_rx = stats_rx.clone();
            let period = Duration::from_secs(self.config.server.stats_interval_secs);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // The first tick completes immediately.
                interval.tick().await;
                let mut last = GraphStats::default();

                loop {
                    interval.tick().await;
                    let stats = stats_rx.borrow().clone();
                    log_health(&stats, &last, period);
                    last = stats;
                }
            })
        };

        info!("✅ Horizon replication host is now running!");
        info!(
            "🔍 Health monitoring active - stats every {} seconds",
            self.config.server.stats_interval_secs
        );
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let signal_shutdown_state = setup_signal_handlers().await?;

        // A second signal skips the graceful path.
        tokio::spawn(async move {
            if let Err(e) = setup_signal_handlers_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }

            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        if signal_shutdown_state.is_shutdown_initiated() {
            shutdown_state.initiate_shutdown();
        }

        info!("📡 Phase 1: Stopping health monitoring...");
        monitoring_handle.abort();

        info!("⏳ Phase 2: Waiting for the tick loop to finish its frame...");
        match tokio::time::timeout(Duration::from_secs(5), tick_handle).await {
            Ok(Ok(simulation)) => {
                info!("✅ Tick loop stopped after {} ticks", simulation.stats().ticks);
            }
            Ok(Err(e)) => {
                error!("❌ Tick loop task failed: {:?}", e);
            }
            Err(_) => {
                warn!("⏰ Tick loop did not stop within timeout, proceeding with shutdown");
            }
        }

        log_final_statistics(&stats_rx.borrow());
        info!("✅ Horizon replication host shutdown complete");
        Ok(())
    }

    fn log_configuration_summary(&self) {
        let replication = &self.config.replication;
        let region = &self.config.server.region;
        info!("📋 Configuration Summary:");
        info!("  ⏱️ Tick rate: {} Hz", replication.general.server_tick_rate);
        info!(
            "  🌍 Region: {:.0}x{:.0}x{:.0} units",
            region.max_x - region.min_x,
            region.max_y - region.min_y,
            region.max_z - region.min_z
        );
        info!("  🗺️ Grid cell size: {:.0}", replication.grid.cell_size);
        info!(
            "  👥 Simulated clients: {} at {} B/s",
            self.config.server.simulated_clients, self.config.server.client_rate_bytes_per_sec
        );
        info!("  📦 Simulated objects: {}", self.config.server.simulated_objects);
        info!(
            "  ⚡ Fast-shared lane: {}",
            if replication.fast_shared.enabled { "enabled" } else { "disabled" }
        );
    }
}

/// Ticks the simulation at `tick_rate` until shutdown is initiated, publishing
/// stats after every frame. Returns the simulation for final reporting.
pub async fn run_tick_loop(
    mut simulation: Simulation,
    tick_rate: f64,
    shutdown_state: ShutdownState,
    stats_tx: watch::Sender<GraphStats>,
) -> Simulation {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_rate));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();

    loop {
        interval.tick().await;
        if shutdown_state.is_shutdown_initiated() {
            break;
        }

        let now = Instant::now();
        let delta = now.duration_since(last).as_secs_f64();
        last = now;

        simulation.step(delta);
        stats_tx.send_replace(simulation.stats().clone());
    }

    shutdown_state.complete_shutdown();
    simulation
}

fn log_health(stats: &GraphStats, last: &GraphStats, period: Duration) {
    let ticks = stats.ticks.saturating_sub(last.ticks);
    let sends = stats.totals.sends.saturating_sub(last.totals.sends);
    let bits = stats.totals.bits_written.saturating_sub(last.totals.bits_written);
    let saturations = stats.totals.saturations.saturating_sub(last.totals.saturations);

    info!(
        "📊 Replication Health - {} ticks | {} sends | {:.1} KiB/s | {} connections | {} objects",
        ticks,
        sends,
        bits as f64 / 8.0 / 1024.0 / period.as_secs_f64(),
        stats.connections,
        stats.objects
    );
    if ticks > 0 && saturations > ticks {
        warn!("🔥 Connections saturated {} times in the last period", saturations);
    }
}

fn log_final_statistics(stats: &GraphStats) {
    info!("📊 Final Statistics:");
    info!("  - Ticks replicated: {} ({} skipped)", stats.ticks, stats.skipped_ticks);
    info!("  - Sends: {}", stats.totals.sends);
    info!("  - Average bits per tick: {:.0}", stats.average_bits_per_tick());
    info!("  - Channel opens/closes: {}/{}", stats.totals.channel_opens, stats.totals.channel_closes);
    info!("  - Fast-shared sends: {}", stats.totals.fast_shared_sends);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.server.simulated_objects = 40;
        config.server.simulated_clients = 2;
        config.replication.general.server_tick_rate = 60.0;
        config
    }

    #[tokio::test]
    async fn test_tick_loop_stops_on_shutdown() {
        let config = quick_config();
        let simulation = Simulation::new(&config).unwrap();
        let shutdown_state = ShutdownState::new();
        let (stats_tx, stats_rx) = watch::channel(GraphStats::default());

        let handle = tokio::spawn(run_tick_loop(simulation, 60.0, shutdown_state.clone(), stats_tx));
        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown_state.initiate_shutdown();

        let simulation = handle.await.unwrap();
        assert!(shutdown_state.is_shutdown_complete());
        assert!(simulation.stats().ticks > 0);
        assert_eq!(stats_rx.borrow().ticks, simulation.stats().ticks);
    }

    #[tokio::test]
    async fn test_loop_exits_without_ticking_after_early_shutdown() {
        let config = quick_config();
        let simulation = Simulation::new(&config).unwrap();
        let shutdown_state = ShutdownState::new();
        shutdown_state.initiate_shutdown();
        let (stats_tx, _stats_rx) = watch::channel(GraphStats::default());

        let simulation = run_tick_loop(simulation, 60.0, shutdown_state, stats_tx).await;
        assert_eq!(simulation.stats().ticks, 0);
    }

    #[test]
    fn test_application_keeps_config() {
        let app = Application::from_config(quick_config());
        assert_eq!(app.config().server.simulated_clients, 2);
    }
}
