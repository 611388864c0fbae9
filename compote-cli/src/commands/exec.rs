//! `compote exec`.

use super::ProjectContext;
use anyhow::Result;
use compote_core::ServiceSelector;

pub async fn run(
    ctx: &ProjectContext,
    selector: String,
    command: Vec<String>,
    env: Vec<String>,
) -> Result<()> {
    let selector = ServiceSelector::parse(&selector)?;
    let mut orchestrator = ctx.orchestrator()?;

    let code = orchestrator
        .exec(&selector.service, selector.replica, &command, &env)
        .await?;

    std::process::exit(code as i32);
}
