//! chomflow - hierarchical flow engine demo
//!
//! Runs a small machine: `start` hands over to the periodic `cron3` state,
//! which counts three firings, records the round through an `audit` flow and
//! goes back to `start`.

mod config;

use chomflow_core::{
    Machine, MachineDefinition, PeriodicTrigger, Scheduler, StateBuilder, StateDefinition,
};
use chomflow_scheduler::{CronScheduler, IntervalScheduler};
use config::Config;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn demo_machine(config: &Config, scheduler: Arc<dyn Scheduler>) -> MachineDefinition {
    let start = StateBuilder::new("start")
        .on_ready(|ctx| {
            tracing::info!(flow = %ctx.flow_name(), "start state");
            ctx.next("cron3")?;
            Ok(())
        })
        .on_exit(|ctx| {
            tracing::info!(flow = %ctx.flow_name(), "exit start state");
            Ok(())
        });

    let cron3 = StateBuilder::new("cron3")
        .on_ready(|ctx| {
            tracing::info!(flow = %ctx.flow_name(), "enter cron3");
            Ok(())
        })
        .on_exit(|ctx| {
            tracing::info!(flow = %ctx.flow_name(), "exit cron3");
            Ok(())
        });

    let counter = PeriodicTrigger::new(scheduler, config.scheduler.cadence.clone())
        .singleton(config.scheduler.singleton)
        .on_tick(|ctx| {
            let scratch = ctx.context_storage();
            let counter = scratch.get_as::<u32>("counter").unwrap_or(0) + 1;
            scratch.set("counter", counter)?;

            tracing::info!(flow = %ctx.flow_name(), counter, "cron tick");

            if counter >= 3 {
                ctx.start("audit", "center")?;
                ctx.next("start")?;
            }
            Ok(())
        });

    let center = StateBuilder::new("center").on_ready(|ctx| {
        let rounds = {
            let global = ctx.global();
            let mut global = global.write();
            let rounds = global.get_as::<u64>("rounds").unwrap_or(0) + 1;
            global.set("rounds", rounds)?;
            rounds
        };
        tracing::info!(flow = %ctx.flow_name(), rounds, "round complete");
        ctx.stop()?;
        Ok(())
    });

    MachineDefinition::new(
        config.machine.name.clone(),
        config.machine.initial_flow.clone(),
        "start",
    )
    .with_state(StateDefinition::basic(start))
    .with_state(StateDefinition::periodic(cron3, counter))
    .with_state(StateDefinition::basic(center))
    .with_history_limit(config.runtime.history_limit)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (from file if CHOMFLOW_CONFIG is set, then env overrides)
    let loaded = Config::load();

    // Initialize logging; RUST_LOG wins over the configured filter
    let filter = loaded
        .as_ref()
        .map(|c| c.log.filter.clone())
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = match loaded {
        Ok(c) => {
            if let Ok(path) = std::env::var("CHOMFLOW_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if std::env::var("CHOMFLOW_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Ignoring invalid environment configuration: {}", e);
            Config::default()
        }
    };

    // Fixed intervals go to the interval scheduler, anything else must be cron
    let cron = Arc::new(CronScheduler::new());
    let interval = Arc::new(IntervalScheduler::new());
    let cadence = &config.scheduler.cadence;
    let scheduler: Arc<dyn Scheduler> = match IntervalScheduler::parse(cadence) {
        Ok(_) => interval.clone() as Arc<dyn Scheduler>,
        Err(_) => {
            if let Err(e) = CronScheduler::parse(cadence) {
                tracing::error!("Invalid scheduler cadence: {}", e);
                return Err(e.into());
            }
            cron.clone() as Arc<dyn Scheduler>
        }
    };

    tracing::info!("Starting chomflow");
    tracing::info!("  Machine: {}", config.machine.name);
    tracing::info!("  Initial flow: {}", config.machine.initial_flow);
    tracing::info!(
        "  Cadence: {} (singleton={})",
        cadence,
        config.scheduler.singleton
    );
    if config.runtime.history_limit > 0 {
        tracing::info!("  History limit: {}", config.runtime.history_limit);
    }

    let machine = Machine::new(demo_machine(&config, scheduler))?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping machine...");

    machine.shutdown();
    cron.shutdown();
    interval.shutdown();
    tokio::task::yield_now().await;

    tracing::info!(
        rounds = machine.global_storage().get_as::<u64>("rounds").unwrap_or(0),
        "Machine stopped"
    );
    Ok(())
}
