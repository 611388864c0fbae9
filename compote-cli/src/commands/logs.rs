//! `compote logs`.

use super::ProjectContext;
use anyhow::Result;
use compote_core::ServiceSelector;

pub async fn run(
    ctx: &ProjectContext,
    selectors: Vec<String>,
    tail: Option<usize>,
    follow: bool,
    include_stderr: bool,
) -> Result<()> {
    let selectors = ServiceSelector::parse_all(&selectors)?;
    let mut orchestrator = ctx.orchestrator()?;

    let mut stream = orchestrator.logs(&selectors, include_stderr, tail, follow).await?;
    while let Some(line) = stream.recv().await {
        println!("{}", line);
    }

    Ok(())
}
