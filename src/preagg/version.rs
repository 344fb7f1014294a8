//! Version hashes of partition builds
//!
//! The structure version changes when the partition's SQL or shape changes;
//! the content version changes when its refresh key value changes. Both are
//! short base32 strings embedded in the physical table name.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::types::{DateRange, Partition};
use crate::store::to_base32;

const VERSION_LEN: usize = 8;

/// 8 character base32 hash of serializable material
pub fn version_hash(material: &impl Serialize) -> String {
    let bytes = serde_json::to_vec(material).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    // 40 bits encode to exactly 8 base32 characters
    let n = digest
        .iter()
        .take(5)
        .fold(0_u64, |acc, byte| (acc << 8) | *byte as u64);
    format!("{:0>width$}", to_base32(n), width = VERSION_LEN)
}

pub fn structure_version(partition: &Partition) -> String {
    version_hash(&(
        &partition.sql,
        &partition.params,
        partition.granularity.as_str(),
        &partition.storage_data_source,
    ))
}

pub fn content_version(
    structure_version: &str,
    refresh_key_value: &str,
    range: &DateRange,
) -> String {
    version_hash(&(structure_version, refresh_key_value, range))
}
