use std::path::Path;

use meshlab_deployer::Deployer;

use crate::manifest;

/// Print the placement constraint of a lab as JSON.
pub async fn schedule(
    deployer: &Deployer,
    manifest_path: &Path,
    strategy: Option<&str>,
    binary: bool,
) -> anyhow::Result<()> {
    let lab = manifest::load_lab(manifest_path)?;
    let semantic = binary.then_some(false);
    let constraint = deployer.compute_constraints(&lab, strategy, semantic).await?;
    println!("{}", serde_json::to_string_pretty(&constraint)?);
    Ok(())
}
