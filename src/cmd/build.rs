//! `conveyor build`: run a submission against the configured store and driver.

use anyhow::{Result, bail};
use conveyor::BuildCoordinator;
use conveyor::config::ConveyorConfig;
use conveyor::dag::{SubmissionSnapshot, SubmissionStatus, TaskEvent, TaskState};
use conveyor::driver::ProcessDriver;
use conveyor::repository::HttpStoreClient;
use conveyor_common::ConfigurationId;
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn cmd_build(config: &ConveyorConfig, root: &str) -> Result<()> {
    let catalog = Arc::new(super::open_catalog(config)?);
    let store = Arc::new(HttpStoreClient::new(
        &config.store.base_url,
        config.store.timeout(),
    )?);
    let driver = Arc::new(ProcessDriver::new(
        &config.driver.shell,
        &config.driver.work_dir,
        &config.driver.log_dir,
    ));

    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = BuildCoordinator::new(store, driver, catalog, config.store.hierarchy_settings())
        .with_scheduler_config(config.scheduler.clone())
        .with_default_product(config.product.product_version())
        .with_event_channel(tx);

    println!();
    println!(
        "{} {}",
        console::style("Building").bold().cyan(),
        console::style(root).bold()
    );
    println!();

    let printer = tokio::spawn(print_events(rx));
    let id = coordinator.submit(&ConfigurationId::from(root)).await?;

    let snapshot = tokio::select! {
        snapshot = coordinator.wait(id) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            println!("{}", console::style("Interrupted, cancelling builds...").yellow());
            coordinator.cancel(id)?;
            coordinator.wait(id).await?
        }
    };

    // Dropping the coordinator closes the event channel and lets the printer drain.
    drop(coordinator);
    let _ = printer.await;

    print_summary(&snapshot);
    if snapshot.status != SubmissionStatus::Succeeded {
        bail!("{} task(s) did not succeed", snapshot.failures.len());
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<TaskEvent>) {
    while let Some(event) = rx.recv().await {
        let state = match event.state {
            TaskState::Success => console::style(event.state.as_str()).green(),
            TaskState::Cancelled => console::style(event.state.as_str()).yellow(),
            s if s.is_unsuccessful() => console::style(event.state.as_str()).red(),
            _ => console::style(event.state.as_str()).dim(),
        };
        println!(
            "  {} {:<24} {}",
            console::style(format!("[{:>3}]", event.sequence)).dim(),
            event.configuration.as_str(),
            state
        );
    }
}

fn print_summary(snapshot: &SubmissionSnapshot) {
    println!();
    let succeeded = snapshot.count_in(TaskState::Success);
    println!(
        "{} {}/{} task(s) succeeded",
        console::style("Summary:").bold(),
        succeeded,
        snapshot.tasks.len()
    );
    for failure in &snapshot.failures {
        println!(
            "  {} {} [{}] {}",
            console::style("✗").red(),
            failure.configuration,
            failure.kind,
            failure.message
        );
    }
    println!();
}
