//! `compote ps`.

use super::ProjectContext;
use anyhow::Result;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "SERVICE")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "REPLICAS")]
    replicas: String,
}

pub async fn run(ctx: &ProjectContext) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;
    let statuses = orchestrator.ps().await?;

    let rows: Vec<ServiceRow> = statuses
        .iter()
        .map(|s| {
            let status = if s.is_running {
                format!("Up ({})", s.running_replicas).green().to_string()
            } else if s.is_known {
                "Stopped".yellow().to_string()
            } else {
                "-".dimmed().to_string()
            };
            ServiceRow {
                name: s.name.clone(),
                status,
                replicas: format!("{}/{}", s.running_replicas, s.known_replicas),
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);

    Ok(())
}
