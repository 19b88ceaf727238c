//! Topology model — devices, collision domains and the interfaces binding them.
//!
//! A [`Lab`] owns every [`Device`] and [`Lan`] by name. Both are created
//! lazily the first time something references them and are never
//! duplicated. Iteration is ordered by name, which keeps scheduler and
//! deployer runs reproducible for the same lab.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{TopologyError, TopologyResult};
use crate::identity::{self, LabHash};
use crate::names;

// ── Device ────────────────────────────────────────────────────────

/// An emulated network endpoint (host, router, switch).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub name: String,
    /// Interface number → name of the collision domain it is attached to.
    pub interfaces: BTreeMap<u32, String>,
    /// Script executed inside the unit once its interfaces are attached.
    pub startup: Option<PathBuf>,
    /// Script executed inside the unit before it is deleted.
    pub shutdown: Option<PathBuf>,
    /// Inline commands run after the startup script.
    pub startup_commands: Vec<String>,
    /// Image override; the settings default applies when unset.
    pub image: Option<String>,
    pub meta: BTreeMap<String, String>,
}

impl Device {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Lowest interface number not yet in use.
    pub fn next_free_interface(&self) -> u32 {
        (0..).find(|n| !self.interfaces.contains_key(n)).unwrap_or(0)
    }

    /// Distinct collision domains this device is attached to.
    pub fn lans(&self) -> BTreeSet<&str> {
        self.interfaces.values().map(String::as_str).collect()
    }

    /// Keep the contiguous run of interfaces starting at 0 and drop the rest.
    ///
    /// Returns the discarded `(interface, lan)` pairs.
    fn check(&mut self) -> Vec<(u32, String)> {
        let keep = self
            .interfaces
            .keys()
            .enumerate()
            .take_while(|(position, number)| *position as u32 == **number)
            .count();

        let discarded: Vec<(u32, String)> = self
            .interfaces
            .iter()
            .skip(keep)
            .map(|(n, lan)| (*n, lan.clone()))
            .collect();

        for (number, _) in &discarded {
            self.interfaces.remove(number);
        }
        discarded
    }
}

// ── Lan ───────────────────────────────────────────────────────────

/// A collision domain: one broadcast segment shared by device interfaces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lan {
    pub name: String,
    /// Attached `(device name, interface number)` pairs.
    pub endpoints: BTreeSet<(String, u32)>,
}

impl Lan {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoints: BTreeSet::new(),
        }
    }

    /// Distinct devices attached to this collision domain.
    pub fn devices(&self) -> BTreeSet<&str> {
        self.endpoints.iter().map(|(d, _)| d.as_str()).collect()
    }

    /// A collision domain with a single device has no peer.
    pub fn is_degenerate(&self) -> bool {
        self.devices().len() < 2
    }
}

// ── Lab ───────────────────────────────────────────────────────────

/// The topology root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lab {
    /// Explicit lab name. When set, the identity is derived from it
    /// instead of from `path`.
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    /// Free-form metadata (author, description, version, ...).
    pub meta: BTreeMap<String, String>,
    devices: BTreeMap<String, Device>,
    lans: BTreeMap<String, Lan>,
}

impl Lab {
    /// Create an empty lab rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Create an empty lab addressed by name rather than by path.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Return the device called `name`, creating it on first reference.
    pub fn get_or_new_device(&mut self, name: &str) -> &mut Device {
        self.devices
            .entry(name.to_string())
            .or_insert_with(|| Device::new(name))
    }

    /// Return the collision domain called `name`, creating it on first reference.
    pub fn get_or_new_lan(&mut self, name: &str) -> &mut Lan {
        self.lans
            .entry(name.to_string())
            .or_insert_with(|| Lan::new(name))
    }

    /// Attach interface `interface` of `device` to collision domain `lan`.
    pub fn connect(&mut self, device: &str, interface: u32, lan: &str) -> TopologyResult<()> {
        let dev = self.get_or_new_device(device);
        if dev.interfaces.contains_key(&interface) {
            return Err(TopologyError::DuplicateInterface {
                device: device.to_string(),
                interface,
            });
        }
        dev.interfaces.insert(interface, lan.to_string());

        self.get_or_new_lan(lan)
            .endpoints
            .insert((device.to_string(), interface));
        debug!(device, interface, lan, "interface attached");
        Ok(())
    }

    /// Attach the next free interface of `device` to `lan`, returning its number.
    pub fn add_interface(&mut self, device: &str, lan: &str) -> TopologyResult<u32> {
        let number = self.get_or_new_device(device).next_free_interface();
        self.connect(device, number, lan)?;
        Ok(number)
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    pub fn lan(&self, name: &str) -> Option<&Lan> {
        self.lans.get(name)
    }

    /// Devices in name order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Collision domains in name order.
    pub fn lans(&self) -> impl Iterator<Item = &Lan> {
        self.lans.values()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn lan_count(&self) -> usize {
        self.lans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Apply the interface contiguity rule to every device.
    ///
    /// Interfaces after the first gap are treated as garbage: they are
    /// removed from the device and from the collision domain they pointed
    /// at. Returns the discarded `(device, interface)` pairs.
    pub fn check(&mut self) -> Vec<(String, u32)> {
        let mut dropped = Vec::new();

        for device in self.devices.values_mut() {
            for (number, lan) in device.check() {
                warn!(
                    device = %device.name,
                    interface = number,
                    lan = %lan,
                    "non-contiguous interface discarded"
                );
                if let Some(lan) = self.lans.get_mut(&lan) {
                    lan.endpoints.remove(&(device.name.clone(), number));
                }
                dropped.push((device.name.clone(), number));
            }
        }
        dropped
    }

    /// Reject device or collision-domain names that are unsafe for backends.
    pub fn validate_names(&self) -> TopologyResult<()> {
        for name in self.devices.keys() {
            names::validate("device", name)?;
        }
        for name in self.lans.keys() {
            names::validate("lan", name)?;
        }
        Ok(())
    }

    /// Namespace identity of this lab.
    pub fn identity(&self) -> TopologyResult<LabHash> {
        match (&self.name, &self.path) {
            (Some(name), _) => Ok(identity::derive_from_name(name)),
            (None, Some(path)) => Ok(identity::derive(path)),
            (None, None) => Err(TopologyError::InvalidTopology(
                "lab has neither a name nor a path".to_string(),
            )),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_lan_lab() -> Lab {
        let mut lab = Lab::new("/labs/two");
        lab.connect("a", 0, "L1").unwrap();
        lab.connect("b", 0, "L1").unwrap();
        lab.connect("b", 1, "L2").unwrap();
        lab.connect("c", 0, "L2").unwrap();
        lab
    }

    #[test]
    fn devices_and_lans_are_created_lazily_once() {
        let mut lab = two_lan_lab();
        assert_eq!(lab.device_count(), 3);
        assert_eq!(lab.lan_count(), 2);

        lab.get_or_new_device("a").meta.insert("k".into(), "v".into());
        assert_eq!(lab.device_count(), 3);
        assert_eq!(lab.device("a").unwrap().meta["k"], "v");
    }

    #[test]
    fn lan_tracks_endpoints() {
        let lab = two_lan_lab();
        let l2 = lab.lan("L2").unwrap();
        assert!(l2.endpoints.contains(&("b".to_string(), 1)));
        assert!(l2.endpoints.contains(&("c".to_string(), 0)));
        assert_eq!(l2.devices().len(), 2);
        assert!(!l2.is_degenerate());
    }

    #[test]
    fn duplicate_interface_is_rejected() {
        let mut lab = two_lan_lab();
        let err = lab.connect("a", 0, "L2").unwrap_err();
        assert_eq!(
            err,
            TopologyError::DuplicateInterface {
                device: "a".into(),
                interface: 0
            }
        );
    }

    #[test]
    fn add_interface_picks_first_free_number() {
        let mut lab = Lab::named("x");
        assert_eq!(lab.add_interface("r1", "A").unwrap(), 0);
        assert_eq!(lab.add_interface("r1", "B").unwrap(), 1);
        lab.connect("r1", 3, "D").unwrap();
        assert_eq!(lab.add_interface("r1", "C").unwrap(), 2);
    }

    #[test]
    fn check_discards_interfaces_after_first_gap() {
        let mut lab = Lab::named("gaps");
        lab.connect("r1", 0, "A").unwrap();
        lab.connect("r1", 1, "B").unwrap();
        lab.connect("r1", 3, "C").unwrap();
        lab.connect("r1", 4, "D").unwrap();

        let dropped = lab.check();
        assert_eq!(dropped, vec![("r1".to_string(), 3), ("r1".to_string(), 4)]);

        let r1 = lab.device("r1").unwrap();
        assert_eq!(r1.interfaces.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert!(lab.lan("C").unwrap().endpoints.is_empty());
    }

    #[test]
    fn check_drops_everything_when_zero_is_missing() {
        let mut lab = Lab::named("nozero");
        lab.connect("r1", 1, "A").unwrap();
        lab.connect("r1", 2, "B").unwrap();

        assert_eq!(lab.check().len(), 2);
        assert!(lab.device("r1").unwrap().interfaces.is_empty());
    }

    #[test]
    fn check_keeps_contiguous_devices_untouched() {
        let mut lab = two_lan_lab();
        let before = lab.clone();
        assert!(lab.check().is_empty());
        assert_eq!(lab, before);
    }

    #[test]
    fn device_iteration_is_name_ordered() {
        let mut lab = Lab::named("order");
        for name in ["zeta", "alpha", "mid"] {
            lab.get_or_new_device(name);
        }
        assert_eq!(lab.device_names(), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn validate_names_rejects_unsafe_lan() {
        let mut lab = Lab::named("names");
        lab.connect("pc1", 0, "bad lan").unwrap();
        assert!(matches!(
            lab.validate_names(),
            Err(TopologyError::NameConflict { kind: "lan", .. })
        ));
    }

    #[test]
    fn identity_prefers_name_over_path() {
        let mut lab = Lab::new("/labs/one");
        let from_path = lab.identity().unwrap();
        lab.name = Some("one".into());
        let from_name = lab.identity().unwrap();
        assert_ne!(from_path, from_name);
        assert_eq!(from_name, identity::derive_from_name("one"));
    }

    #[test]
    fn identity_requires_name_or_path() {
        let lab = Lab::default();
        assert!(matches!(lab.identity(), Err(TopologyError::InvalidTopology(_))));
    }
}
