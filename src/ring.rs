//! Consistent-hash ring: maps storage paths to partitions and devices.
//!
//! The ring is produced offline and loaded once at startup; the proxy never
//! mutates it. Placement hashes the storage path with a cluster-wide secret
//! suffix so partition assignment cannot be steered from outside.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Handoff candidates are capped regardless of how many devices exist; a
/// partition that cannot land on nine extra devices has bigger problems.
pub const MORE_NODES_CAP: usize = 9;

/// One storage device. The value struct handed to the fan-out engine;
/// health bookkeeping lives in the error limiter, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: u16,
    pub zone: u32,
    pub ip: String,
    pub port: u16,
    pub device: String,
}

impl Node {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.device)
    }
}

/// On-disk ring file: replica assignment rows plus the device table.
/// `devs` is indexed by device id; removed devices leave `None` holes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingData {
    pub part_shift: u32,
    pub replica2part2dev: Vec<Vec<u16>>,
    pub devs: Vec<Option<Node>>,
}

#[derive(thiserror::Error, Debug)]
pub enum RingError {
    #[error("ring file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("ring file undecodable: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("ring invalid: {0}")]
    Invalid(String),
}

/// Immutable placement structure for one storage tier.
#[derive(Debug)]
pub struct Ring {
    data: RingData,
    hash_suffix: String,
}

impl Ring {
    pub fn new(data: RingData, hash_suffix: impl Into<String>) -> Result<Self, RingError> {
        if data.replica2part2dev.is_empty() {
            return Err(RingError::Invalid("no replica rows".into()));
        }
        let parts = data.replica2part2dev[0].len();
        if parts == 0 || !parts.is_power_of_two() {
            return Err(RingError::Invalid(format!(
                "partition count {parts} is not a power of two"
            )));
        }
        if data.part_shift != 32 - parts.trailing_zeros() {
            return Err(RingError::Invalid(format!(
                "part_shift {} inconsistent with {parts} partitions",
                data.part_shift
            )));
        }
        for row in &data.replica2part2dev {
            if row.len() != parts {
                return Err(RingError::Invalid("replica rows differ in length".into()));
            }
            for &dev_id in row {
                if data.devs.get(dev_id as usize).map(Option::as_ref).flatten().is_none() {
                    return Err(RingError::Invalid(format!("unknown device id {dev_id}")));
                }
            }
        }
        for part in 0..parts {
            let mut seen = HashSet::new();
            for row in &data.replica2part2dev {
                if !seen.insert(row[part]) {
                    return Err(RingError::Invalid(format!(
                        "partition {part} assigned twice to device {}",
                        row[part]
                    )));
                }
            }
        }
        Ok(Self { data, hash_suffix: hash_suffix.into() })
    }

    /// Load a JSON ring file.
    pub fn load(path: &Path, hash_suffix: impl Into<String>) -> Result<Self, RingError> {
        let raw = std::fs::read(path)?;
        let data: RingData = serde_json::from_slice(&raw)?;
        Self::new(data, hash_suffix)
    }

    pub fn replica_count(&self) -> usize {
        self.data.replica2part2dev.len()
    }

    pub fn partition_count(&self) -> usize {
        self.data.replica2part2dev[0].len()
    }

    /// Partition for a storage path.
    pub fn partition(&self, account: &str, container: Option<&str>, object: Option<&str>) -> u32 {
        let mut key = format!("/{account}");
        if let Some(container) = container {
            key.push('/');
            key.push_str(container);
            if let Some(object) = object {
                key.push('/');
                key.push_str(object);
            }
        }
        key.push_str(&self.hash_suffix);
        let digest = md5::compute(key.as_bytes());
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        prefix >> self.data.part_shift
    }

    /// Partition plus its primary nodes, in replica order.
    pub fn get_nodes(
        &self,
        account: &str,
        container: Option<&str>,
        object: Option<&str>,
    ) -> (u32, Vec<Node>) {
        let part = self.partition(account, container, object);
        (part, self.get_part_nodes(part))
    }

    pub fn get_part_nodes(&self, part: u32) -> Vec<Node> {
        self.data
            .replica2part2dev
            .iter()
            .map(|row| self.dev(row[part as usize]))
            .collect()
    }

    /// Handoff candidates for a partition: a deterministic pseudo-random
    /// permutation of the remaining devices, unseen zones first, capped at
    /// [`MORE_NODES_CAP`].
    pub fn more_nodes(&self, part: u32) -> Vec<Node> {
        let primary_ids: HashSet<u16> = self
            .data
            .replica2part2dev
            .iter()
            .map(|row| row[part as usize])
            .collect();
        let mut used_zones: HashSet<u32> =
            primary_ids.iter().map(|&id| self.dev(id).zone).collect();

        let mut candidates: Vec<&Node> = self
            .data
            .devs
            .iter()
            .flatten()
            .filter(|dev| !primary_ids.contains(&dev.id))
            .collect();
        candidates.sort_by_key(|dev| {
            md5::compute(format!("{part}:{}{}", dev.id, self.hash_suffix).as_bytes()).0
        });

        let mut ordered: Vec<Node> = Vec::new();
        let mut taken: HashSet<u16> = HashSet::new();
        for dev in &candidates {
            if ordered.len() >= MORE_NODES_CAP {
                return ordered;
            }
            if used_zones.insert(dev.zone) {
                taken.insert(dev.id);
                ordered.push((*dev).clone());
            }
        }
        for dev in &candidates {
            if ordered.len() >= MORE_NODES_CAP {
                break;
            }
            if !taken.contains(&dev.id) {
                ordered.push((*dev).clone());
            }
        }
        ordered
    }

    fn dev(&self, id: u16) -> Node {
        // Validated in `new`; ids in replica rows always resolve.
        self.data.devs[id as usize].clone().unwrap_or_else(|| {
            unreachable!("device id {id} validated at ring construction")
        })
    }
}
