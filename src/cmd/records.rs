//! `conveyor records`: list persisted build records.

use anyhow::{Result, bail};
use conveyor::config::ConveyorConfig;
use conveyor_common::{BuildStatus, Catalog, ConfigurationId};

pub async fn cmd_records(
    config: &ConveyorConfig,
    configuration: Option<&str>,
    project: Option<&str>,
) -> Result<()> {
    let catalog = super::open_catalog(config)?;

    let records = match (configuration, project) {
        (Some(id), _) => {
            catalog
                .records_for_configuration(&ConfigurationId::from(id))
                .await?
        }
        (None, Some(project)) => catalog.records_for_project(project).await?,
        (None, None) => bail!("Name a configuration or pass --project"),
    };

    if records.is_empty() {
        println!("No build records found.");
        return Ok(());
    }

    for record in &records {
        let status = match record.status {
            BuildStatus::Success => console::style(record.status.to_string()).green(),
            BuildStatus::Cancelled => console::style(record.status.to_string()).yellow(),
            _ => console::style(record.status.to_string()).red(),
        };
        println!(
            "{}  {:<24} {}  built={} deps={}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.configuration.as_str(),
            status,
            record.built_artifacts.len(),
            record.dependencies.len()
        );
        if let Some(log) = &record.log_reference {
            println!("    {} {}", console::style("log:").dim(), log);
        }
        if let Some(error) = &record.error {
            println!("    {} {}", console::style("error:").red(), error);
        }
    }
    Ok(())
}
