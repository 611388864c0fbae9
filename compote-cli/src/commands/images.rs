//! `compote pull` and `compote push`.

use super::ProjectContext;
use anyhow::Result;

pub async fn pull(ctx: &ProjectContext, services: Vec<String>) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;
    let filter = if services.is_empty() { None } else { Some(services.as_slice()) };
    orchestrator.pull(filter).await?;
    Ok(())
}

pub async fn push(ctx: &ProjectContext, services: Vec<String>) -> Result<()> {
    let mut orchestrator = ctx.orchestrator()?;
    let filter = if services.is_empty() { None } else { Some(services.as_slice()) };
    orchestrator.push(filter).await?;
    Ok(())
}
