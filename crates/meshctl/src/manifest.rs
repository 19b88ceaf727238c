//! Lab manifest — a TOML or JSON file describing one lab.
//!
//! ```toml
//! [lab]
//! name = "ospf"          # optional, identity comes from the path otherwise
//! description = "two areas"
//!
//! [[device]]
//! name = "r1"
//! lans = ["A", "B"]      # eth0 on A, eth1 on B
//! startup = "r1.startup" # relative to the manifest directory
//! exec = ["ip link set eth0 up"]
//!
//! [device.meta]
//! ospf_area = "0"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use meshlab_core::Lab;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub lab: LabSection,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LabSection {
    pub name: Option<String>,
    /// Everything else is kept as lab metadata.
    #[serde(flatten)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    pub name: String,
    /// Collision domains in interface order.
    #[serde(default)]
    pub lans: Vec<String>,
    pub startup: Option<PathBuf>,
    pub shutdown: Option<PathBuf>,
    pub image: Option<String>,
    /// Inline startup commands.
    #[serde(default)]
    pub exec: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse `path`, as JSON for a `.json` extension and as TOML otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lab manifest {}", path.display()))?;
        let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let manifest = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON manifest {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("invalid TOML manifest {}", path.display()))?
        };
        Ok(manifest)
    }

    /// Build the topology, with scripts resolved against `root`.
    pub fn into_lab(self, root: &Path) -> Result<Lab> {
        let mut lab = match self.lab.name {
            Some(name) => Lab::named(name),
            None => Lab::default(),
        };
        lab.path = Some(root.to_path_buf());
        lab.meta = self.lab.meta;

        for entry in self.devices {
            if lab.device(&entry.name).is_some() {
                bail!("device `{}` is declared twice", entry.name);
            }
            let device = lab.get_or_new_device(&entry.name);
            device.startup = entry.startup;
            device.shutdown = entry.shutdown;
            device.image = entry.image;
            device.startup_commands = entry.exec;
            device.meta = entry.meta;

            for (number, lan) in entry.lans.iter().enumerate() {
                lab.connect(&entry.name, number as u32, lan)?;
            }
        }

        lab.validate_names()?;
        Ok(lab)
    }
}

/// Load the manifest at `path` and build its lab rooted at the manifest directory.
pub fn load_lab(path: &Path) -> Result<Lab> {
    let root = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let root = std::path::absolute(&root).unwrap_or(root);
    Manifest::load(path)?.into_lab(&root)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[lab]
description = "ospf between two routers"
author = "net team"

[[device]]
name = "r1"
lans = ["A", "B"]
startup = "r1.startup"
exec = ["ip link set eth0 up"]

[device.meta]
ospf_area = "0"

[[device]]
name = "r2"
lans = ["B"]
image = "frr:latest"
"#;

    #[test]
    fn toml_manifest_builds_lab() {
        let manifest: Manifest = toml::from_str(SAMPLE).unwrap();
        let lab = manifest.into_lab(Path::new("/labs/ospf")).unwrap();

        assert_eq!(lab.device_names(), vec!["r1", "r2"]);
        assert_eq!(lab.lan_count(), 2);
        assert_eq!(lab.meta["author"], "net team");
        assert_eq!(lab.path(), Some(Path::new("/labs/ospf")));
        assert!(lab.name.is_none());

        let r1 = lab.device("r1").unwrap();
        assert_eq!(r1.interfaces[&0], "A");
        assert_eq!(r1.interfaces[&1], "B");
        assert_eq!(r1.startup.as_deref(), Some(Path::new("r1.startup")));
        assert_eq!(r1.startup_commands, vec!["ip link set eth0 up"]);
        assert_eq!(r1.meta["ospf_area"], "0");

        let r2 = lab.device("r2").unwrap();
        assert_eq!(r2.image.as_deref(), Some("frr:latest"));
        assert_eq!(r2.interfaces[&0], "B");
    }

    #[test]
    fn json_manifest_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.json");
        std::fs::write(
            &path,
            r#"{"lab": {"name": "demo"}, "device": [{"name": "pc", "lans": ["A"]}]}"#,
        )
        .unwrap();

        let lab = load_lab(&path).unwrap();
        assert_eq!(lab.name.as_deref(), Some("demo"));
        assert_eq!(lab.path(), Some(dir.path()));
        assert_eq!(lab.device("pc").unwrap().interfaces.len(), 1);
    }

    #[test]
    fn duplicate_device_is_rejected() {
        let manifest: Manifest = toml::from_str(
            r#"
[[device]]
name = "r1"
[[device]]
name = "r1"
"#,
        )
        .unwrap();
        assert!(manifest.into_lab(Path::new("/labs/x")).is_err());
    }

    #[test]
    fn unsafe_names_are_rejected() {
        let manifest: Manifest = toml::from_str(
            r#"
[[device]]
name = "r1"
lans = ["bad lan"]
"#,
        )
        .unwrap();
        assert!(manifest.into_lab(Path::new("/labs/x")).is_err());
    }

    #[test]
    fn unknown_device_keys_are_rejected() {
        let parsed: Result<Manifest, _> = toml::from_str(
            r#"
[[device]]
name = "r1"
bridged = true
"#,
        );
        assert!(parsed.is_err());
    }
}
