//! Hostname-based host/module/NUMA topology discovery (spec §4.5), grounded
//! on the teacher's `arch/*/kernel/topology.rs` style of building a tree of
//! scope-tagged domains from per-core hardware facts, generalized here from
//! "per core" to "per unit, gathered over the team".

use std::collections::BTreeMap;

use crate::error::{DartError, Result};
use crate::team::TeamNode;

/// Scope of a locality domain, assigned by tree depth (spec §4.5 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    Undefined,
    Global,
    Node,
    Module,
    Numa,
    Unit,
    Core,
}

/// One node in the locality tree, keyed by a dotted tag path such as
/// `.0.3.1` (node 0, module 3, NUMA 1).
#[derive(Debug, Clone)]
pub struct Domain {
    pub tag: String,
    pub scope: Scope,
    pub host: Option<String>,
    pub units: Vec<i32>,
    pub children: Vec<String>,
}

impl Domain {
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// The locality tree for a team, built bottom-up from all-gathered hostnames
/// (spec §4.5 steps 1–3).
pub struct LocalityTree {
    domains: BTreeMap<String, Domain>,
    /// `Some(distance)` when both units were observed on the same host
    /// (distance 0 on the loopback substrate); `None` across hosts or when no
    /// NUMA information was gathered (SPEC_FULL.md "Host topology discovery
    /// detail" — a thin, honest stand-in, not a hardware topology reader).
    unit_host: BTreeMap<i32, String>,
}

impl LocalityTree {
    /// Builds the tree collectively on `team`: every unit all-gathers its own
    /// hostname, then every unit runs the identical deterministic construction
    /// so no further communication is required (spec §4.5).
    pub fn build(team: &TeamNode, caller_unit: i32, my_hostname: &str) -> Result<Self> {
        let padded = pad_hostname(my_hostname);
        let gathered = crate::collectives::allgather(team, caller_unit, &padded)?;
        let hostnames: Vec<String> = gathered
            .chunks(HOSTNAME_SLOT)
            .map(unpad_hostname)
            .collect();

        if hostnames.len() != team.group.len() {
            return Err(DartError::Other(
                "hostname allgather returned an unexpected number of entries".into(),
            ));
        }

        let mut by_host: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        let mut unit_host = BTreeMap::new();
        for (local_idx, host) in hostnames.iter().enumerate() {
            let unit = team.group[local_idx];
            by_host.entry(host.clone()).or_default().push(unit);
            unit_host.insert(unit, host.clone());
        }

        let mut hosts: Vec<String> = by_host.keys().cloned().collect();
        hosts.sort();

        let mut domains = BTreeMap::new();
        domains.insert(
            ".".to_string(),
            Domain {
                tag: ".".to_string(),
                scope: Scope::Global,
                host: None,
                units: team.group.clone(),
                children: Vec::new(),
            },
        );

        // Shorter hostnames that prefix other hostnames become parents
        // (spec §4.5 step 3: `node124` parents `node124-mic0`).
        for (i, host) in hosts.iter().enumerate() {
            let tag = format!(".{i}");
            let is_parent = hosts.iter().any(|other| other != host && other.starts_with(host.as_str()));
            let scope = if is_parent { Scope::Node } else { Scope::Module };
            domains.insert(
                tag.clone(),
                Domain {
                    tag: tag.clone(),
                    scope,
                    host: Some(host.clone()),
                    units: by_host[host].clone(),
                    children: Vec::new(),
                },
            );
            domains.get_mut(".").unwrap().children.push(tag);
        }

        Ok(LocalityTree { domains, unit_host })
    }

    pub fn domain(&self, tag: &str) -> Option<&Domain> {
        self.domains.get(tag)
    }

    pub fn domains_at_scope(&self, scope: Scope) -> Vec<&Domain> {
        self.domains.values().filter(|d| d.scope == scope).collect()
    }

    /// Best-effort NUMA distance hint (SPEC_FULL.md supplement): `Some(0)`
    /// when both units share a host on this loopback substrate, `None`
    /// otherwise or when either unit was never observed.
    pub fn numa_distance(&self, unit_a: i32, unit_b: i32) -> Option<u32> {
        let host_a = self.unit_host.get(&unit_a)?;
        let host_b = self.unit_host.get(&unit_b)?;
        if host_a == host_b {
            Some(0)
        } else {
            None
        }
    }
}

const HOSTNAME_SLOT: usize = 64;

fn pad_hostname(name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; HOSTNAME_SLOT];
    let bytes = name.as_bytes();
    let n = bytes.len().min(HOSTNAME_SLOT - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn unpad_hostname(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).to_string()
}
