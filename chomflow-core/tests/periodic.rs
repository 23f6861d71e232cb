//! Periodic states driven by a hand-fired scheduler.

mod common;

use chomflow_core::{
    Machine, MachineDefinition, PeriodicTrigger, StateBuilder, StateDefinition,
};
use common::{settle, wait_until, ManualScheduler, RecordingSink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn counting_trigger(scheduler: Arc<ManualScheduler>) -> PeriodicTrigger {
    PeriodicTrigger::new(scheduler, "*/1 * * * * *")
        .singleton(true)
        .on_tick(|ctx| {
            let flow = ctx.flow_storage();
            let count = flow.get_as::<u32>("count").unwrap_or(0) + 1;
            flow.set("count", count)?;
            if count >= 3 {
                ctx.next("done")?;
            }
            Ok(())
        })
}

fn done_state() -> StateDefinition {
    StateDefinition::basic(StateBuilder::new("done").on_ready(|ctx| {
        ctx.global().set("done", true)?;
        ctx.stop()?;
        Ok(())
    }))
}

#[tokio::test]
async fn test_periodic_counts_to_three_then_leaves() {
    let scheduler = ManualScheduler::new();
    let cron3 = StateDefinition::periodic(
        StateBuilder::new("cron3"),
        counting_trigger(scheduler.clone()),
    );
    let def = MachineDefinition::new("periodic", "main", "cron3")
        .with_state(cron3)
        .with_state(done_state());
    let machine = Machine::new(def).unwrap();
    let ctx = machine.flow("main").unwrap().context().clone();

    wait_until("trigger installed", || scheduler.installed().len() == 1).await;
    wait_until("entry committed", || !ctx.has_transaction()).await;

    let trigger = scheduler.last().unwrap();
    assert_eq!(trigger.cadence, "*/1 * * * * *");
    assert!(trigger.singleton);
    assert!(!trigger.is_cancelled());

    for _ in 0..3 {
        trigger.fire();
        wait_until("firing committed", || !ctx.has_transaction()).await;
    }

    wait_until("done reached", || {
        machine.global_storage().get_as::<bool>("done") == Some(true)
    })
    .await;

    assert!(trigger.is_cancelled());
    assert_eq!(ctx.flow_storage().get_as::<u32>("count"), Some(3));
    assert_eq!(ctx.state_name(), "done");
    assert_eq!(scheduler.installed().len(), 1);
}

#[tokio::test]
async fn test_periodic_runs_user_ready_and_exit() {
    let scheduler = ManualScheduler::new();
    let readies = Arc::new(AtomicU32::new(0));
    let exits = Arc::new(AtomicU32::new(0));

    let (r, e) = (readies.clone(), exits.clone());
    let builder = StateBuilder::new("cron3")
        .on_ready(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .on_exit(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    let def = MachineDefinition::new("periodic", "main", "cron3").with_state(
        StateDefinition::periodic(builder, counting_trigger(scheduler.clone())),
    );
    let machine = Machine::new(def).unwrap();
    let flow = machine.flow("main").unwrap();

    wait_until("trigger installed", || scheduler.installed().len() == 1).await;
    assert_eq!(readies.load(Ordering::SeqCst), 1);

    flow.stop();
    wait_until("exit ran", || exits.load(Ordering::SeqCst) == 1).await;
    assert!(scheduler.last().unwrap().is_cancelled());

    // Firing a cancelled trigger against a stopped flow does nothing
    scheduler.last().unwrap().fire();
    settle().await;
    assert_eq!(flow.flow_storage().get_as::<u32>("count"), None);
}

#[tokio::test]
async fn test_failed_firing_rolls_back_and_reports() {
    let scheduler = ManualScheduler::new();
    let sink = RecordingSink::new();
    let trigger = PeriodicTrigger::new(scheduler.clone(), "* * * * * *").on_tick(|ctx| {
        ctx.next("done")?;
        Err("tick failed".into())
    });
    let def = MachineDefinition::new("periodic", "main", "cron3")
        .with_state(StateDefinition::periodic(StateBuilder::new("cron3"), trigger))
        .with_state(done_state())
        .with_diagnostics(sink.clone());
    let machine = Machine::new(def).unwrap();
    let ctx = machine.flow("main").unwrap().context().clone();

    wait_until("trigger installed", || scheduler.installed().len() == 1).await;
    wait_until("entry committed", || !ctx.has_transaction()).await;

    scheduler.last().unwrap().fire();

    let reported = sink.errors_for("cron");
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].message, "tick failed");
    assert!(!ctx.has_transaction());

    settle().await;
    assert_eq!(ctx.state_name(), "cron3");
    assert!(ctx.is_running());
}

#[tokio::test]
async fn test_rejected_cadence_fails_ready() {
    let scheduler = ManualScheduler::new();
    let sink = RecordingSink::new();
    let trigger = PeriodicTrigger::new(scheduler.clone(), "");
    let def = MachineDefinition::new("periodic", "main", "cron3")
        .with_state(StateDefinition::periodic(
            StateBuilder::new("cron3").retry_count(1),
            trigger,
        ))
        .with_diagnostics(sink.clone());
    let _machine = Machine::new(def).unwrap();

    wait_until("ready failure reported", || !sink.errors_for("ready").is_empty()).await;

    let reported = sink.errors_for("ready");
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].message, "invalid cadence '': empty");
    assert!(scheduler.installed().is_empty());
}
