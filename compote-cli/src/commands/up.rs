//! `compote up`.

use super::ProjectContext;
use anyhow::Result;
use colored::Colorize;

pub async fn run(ctx: &ProjectContext, services: Vec<String>, detach: bool) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;
    let filter = if services.is_empty() { None } else { Some(services.as_slice()) };

    println!("{} Bringing project {} up", "→".cyan().bold(), ctx.project.bold());

    orchestrator.up(filter, detach).await?;

    if detach {
        println!("{} Project {} is up", "✓".green().bold(), ctx.project.bold());
    }
    Ok(())
}
