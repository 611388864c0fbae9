//! `compote start`, `stop`, `restart`, and `scale`.

use super::ProjectContext;
use anyhow::Result;
use colored::Colorize;
use compote_core::{ScaleTarget, ServiceSelector};
use std::time::Duration;

pub async fn start(ctx: &ProjectContext, selectors: Vec<String>) -> Result<()> {
    let selectors = ServiceSelector::parse_all(&selectors)?;
    let mut orchestrator = ctx.orchestrator()?;

    orchestrator.start(&selectors).await?;
    println!("{} Started", "✓".green().bold());
    Ok(())
}

pub async fn stop(ctx: &ProjectContext, selectors: Vec<String>, timeout: u64) -> Result<()> {
    let selectors = ServiceSelector::parse_all(&selectors)?;
    let mut orchestrator = ctx.orchestrator()?;

    orchestrator.stop(&selectors, Duration::from_secs(timeout)).await?;
    println!("{} Stopped", "✓".green().bold());
    Ok(())
}

pub async fn restart(ctx: &ProjectContext, selectors: Vec<String>, timeout: u64) -> Result<()> {
    let selectors = ServiceSelector::parse_all(&selectors)?;
    let mut orchestrator = ctx.orchestrator()?;

    orchestrator.restart(&selectors, Duration::from_secs(timeout)).await?;
    println!("{} Restarted", "✓".green().bold());
    Ok(())
}

pub async fn scale(ctx: &ProjectContext, targets: Vec<String>) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;

    for target in &targets {
        let target = ScaleTarget::parse(target)?;
        orchestrator.scale(&target.service, target.replicas).await?;
        println!(
            "{} {} scaled to {}",
            "✓".green().bold(),
            target.service.bold(),
            target.replicas
        );
    }
    Ok(())
}
