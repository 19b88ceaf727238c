//! `meshctl deploy | undeploy | info | wipe`.

use std::path::Path;

use meshlab_core::{Lab, LabHash};
use meshlab_deployer::{Deployer, LabInfo};
use tracing::info;

use crate::manifest;

/// Deploy the lab of `manifest_path`, or only `devices` when not empty.
///
/// Placement is always computed over the whole lab, so a device lands on
/// the same node whether it is deployed alone or with the rest.
pub async fn deploy(
    deployer: &Deployer,
    manifest_path: &Path,
    strategy: Option<&str>,
    binary: bool,
    devices: &[String],
) -> anyhow::Result<()> {
    let lab = manifest::load_lab(manifest_path)?;
    let constraint = deployer
        .compute_constraints(&lab, strategy, binary.then_some(false))
        .await?;
    let hash = deployer
        .deploy_devices(&lab, Some(&constraint), devices)
        .await?;

    println!("{}", deploy_summary(&lab, devices, constraint.group_count(), &hash));
    Ok(())
}

fn deploy_summary(lab: &Lab, devices: &[String], nodes: usize, hash: &LabHash) -> String {
    if devices.is_empty() {
        format!(
            "✓ Deployed {} devices on {} node(s) as {}",
            lab.device_count(),
            nodes,
            hash.short()
        )
    } else {
        format!("✓ Deployed {} in {}", devices.join(", "), hash.short())
    }
}

pub async fn undeploy(deployer: &Deployer, manifest_path: &Path, devices: &[String]) -> anyhow::Result<()> {
    let lab = manifest::load_lab(manifest_path)?;
    let hash = lab.identity()?;
    let filter = (!devices.is_empty()).then_some(devices);
    deployer.undeploy(&hash, filter).await?;

    match filter {
        Some(devices) => println!("✓ Undeployed {} from {}", devices.join(", "), hash.short()),
        None => println!("✓ Undeployed {}", hash.short()),
    }
    Ok(())
}

pub async fn wipe(deployer: &Deployer) -> anyhow::Result<()> {
    let labs = deployer.undeploy_all().await?;
    info!(labs = labs.len(), "wipe finished");
    println!("✓ Removed {} lab(s)", labs.len());
    Ok(())
}

pub async fn info(
    deployer: &Deployer,
    manifest_path: &Path,
    devices: &[String],
    format: &str,
) -> anyhow::Result<()> {
    let lab = manifest::load_lab(manifest_path)?;
    let hash = lab.identity()?;
    let filter = (!devices.is_empty()).then_some(devices);
    let info = deployer.get_lab_info(&hash, filter).await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&info)?),
        _ => println!("{}", format_info(&info)),
    }
    Ok(())
}

fn format_info(info: &LabInfo) -> String {
    let mut out = format!("lab {} ({})\n", info.lab.short(), info.state);
    if info.devices.is_empty() {
        out.push_str("no devices deployed\n");
        return out;
    }

    out.push_str(&format!("{:<16} {:<16} {:<8} INTERFACES\n", "DEVICE", "NODE", "STATUS"));
    for unit in &info.devices {
        let node = unit.node.as_ref().map(|n| n.name.as_str()).unwrap_or("-");
        let status = if unit.running { "running" } else { "stopped" };
        let interfaces: Vec<String> = unit
            .interfaces
            .iter()
            .map(|(n, lan)| format!("eth{n}={lan}"))
            .collect();
        out.push_str(&format!(
            "{:<16} {:<16} {:<8} {}\n",
            unit.device,
            node,
            status,
            interfaces.join(" ")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use meshlab_core::{ClusterNode, LabState};
    use meshlab_deployer::UnitInfo;

    #[test]
    fn text_info_lists_devices() {
        let info = LabInfo {
            lab: LabHash::from_raw("0123456789abcdef0123"),
            state: LabState::Deployed,
            devices: vec![UnitInfo {
                device: "r1".into(),
                id: "r1".into(),
                node: Some(ClusterNode::new("n1")),
                running: true,
                interfaces: BTreeMap::from([(0, "A".to_string()), (1, "B".to_string())]),
            }],
            segments: Vec::new(),
        };

        let text = format_info(&info);
        assert!(text.contains("DEVICE"));
        assert!(text.contains("eth0=A eth1=B"));
        assert!(text.contains("running"));
        assert!(text.contains("n1"));
    }

    #[test]
    fn deploy_summary_names_the_selection() {
        let mut lab = Lab::named("summary");
        lab.connect("r1", 0, "A").unwrap();
        lab.connect("pc1", 0, "A").unwrap();
        let hash = LabHash::from_raw("0123456789abcdef0123");

        let all = deploy_summary(&lab, &[], 2, &hash);
        assert!(all.contains("2 devices on 2 node(s)"));

        let some = deploy_summary(&lab, &["pc1".to_string()], 2, &hash);
        assert!(some.contains("pc1"));
        assert!(some.contains(&hash.short()));
    }

    #[test]
    fn text_info_for_empty_lab() {
        let info = LabInfo {
            lab: LabHash::from_raw("abc"),
            state: LabState::Undeployed,
            devices: Vec::new(),
            segments: Vec::new(),
        };
        assert!(format_info(&info).contains("no devices deployed"));
    }
}
