use std::path::Path;
use tracing::instrument;

use crate::Error;

/// Run the configured build script inside the staged tree. Nothing to do when unset.
#[instrument]
pub async fn build(directory: &Path, build_script: Option<&str>) -> Result<(), Error> {
    let Some(script) = build_script else {
        return Ok(());
    };
    tracing::info!("running build script on {:?}", directory);
    crate::command::run_shell(script, Some(directory)).await
}
