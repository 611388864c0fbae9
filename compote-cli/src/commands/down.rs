//! `compote down`.

use super::ProjectContext;
use anyhow::Result;
use colored::Colorize;

pub async fn run(ctx: &ProjectContext, volumes: bool) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;

    orchestrator.down(volumes).await?;

    println!("{} Project {} is down", "✓".green().bold(), ctx.project.bold());
    Ok(())
}
