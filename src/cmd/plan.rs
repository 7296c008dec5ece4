//! `conveyor plan`: show what a build would do without running it.

use anyhow::Result;
use conveyor::config::ConveyorConfig;
use conveyor::dag::{GraphBuilder, Submission};
use conveyor_common::{ConfigurationId, SubmissionId};
use std::sync::Arc;

pub async fn cmd_plan(config: &ConveyorConfig, root: &str) -> Result<()> {
    let catalog = Arc::new(super::open_catalog(config)?);
    let root = ConfigurationId::from(root);

    let graph = GraphBuilder::new(catalog)
        .with_rebuild_dependencies(config.scheduler.rebuild_dependencies)
        .load(&root)
        .await?;
    let product = graph
        .root_configuration()
        .and_then(|c| c.product_version.clone())
        .unwrap_or_else(|| config.product.product_version());

    let mut submission = Submission::new(SubmissionId::new(), product);
    GraphBuilder::expand(&graph, &mut submission)?;

    println!();
    println!(
        "{} {} ({})",
        console::style("Build plan for").bold().cyan(),
        console::style(&root).bold(),
        submission.product()
    );
    println!();

    for (index, wave) in submission.compute_waves().iter().enumerate() {
        let names: Vec<&str> = wave.iter().map(|id| id.as_str()).collect();
        println!("  Wave {}: {}", index, names.join(", "));
    }

    let mut prebuilt: Vec<&str> = graph.prebuilt().map(|id| id.as_str()).collect();
    if !prebuilt.is_empty() {
        prebuilt.sort_unstable();
        println!();
        println!(
            "  {} {}",
            console::style("Already built:").dim(),
            prebuilt.join(", ")
        );
    }

    println!();
    println!("{} task(s)", submission.len());
    Ok(())
}
