//! Storage quantity parsing and formatting.
//!
//! Kubernetes expresses capacities as strings such as `10Gi` or `500M`. The
//! controller compares sizes in bytes, so every quantity is normalised here.

use crate::error::{CoreError, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Key of the storage entry in capacity/request maps
pub const STORAGE_RESOURCE: &str = "storage";

const KIB: i64 = 1024;
const MIB: i64 = KIB * 1024;
const GIB: i64 = MIB * 1024;
const TIB: i64 = GIB * 1024;
const PIB: i64 = TIB * 1024;
const EIB: i64 = PIB * 1024;

const BINARY_SUFFIXES: [(&str, i64); 6] = [
    ("Ki", KIB),
    ("Mi", MIB),
    ("Gi", GIB),
    ("Ti", TIB),
    ("Pi", PIB),
    ("Ei", EIB),
];

const DECIMAL_SUFFIXES: [(&str, i64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parse a storage quantity (e.g. "1024", "512Mi", "10Gi", "1.5T") into bytes
pub fn parse_storage(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CoreError::invalid_quantity(s, "empty value"));
    }

    let (number, multiplier) = split_suffix(s);
    if number.is_empty() {
        return Err(CoreError::invalid_quantity(s, "missing numeric part"));
    }

    if let Ok(whole) = number.parse::<i64>() {
        if whole < 0 {
            return Err(CoreError::invalid_quantity(s, "negative capacity"));
        }
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| CoreError::invalid_quantity(s, "value overflows 64 bits"));
    }

    let fractional: f64 = number
        .parse()
        .map_err(|e| CoreError::invalid_quantity(s, format!("{}", e)))?;
    if !fractional.is_finite() || fractional < 0.0 {
        return Err(CoreError::invalid_quantity(s, "not a finite positive number"));
    }
    let bytes = (fractional * multiplier as f64).ceil();
    if bytes >= i64::MAX as f64 {
        return Err(CoreError::invalid_quantity(s, "value overflows 64 bits"));
    }
    Ok(bytes as i64)
}

fn split_suffix(s: &str) -> (&str, i64) {
    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return (number, multiplier);
        }
    }
    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return (number, multiplier);
        }
    }
    (s, 1)
}

/// Format bytes as a quantity, picking the largest exact binary suffix.
///
/// 10737418240 -> "10Gi", 1610612736 -> "1536Mi", 1000 -> "1000".
pub fn format_storage(bytes: i64) -> String {
    if bytes > 0 {
        for (suffix, multiplier) in BINARY_SUFFIXES.iter().rev() {
            if bytes % multiplier == 0 {
                return format!("{}{}", bytes / multiplier, suffix);
            }
        }
    }
    format!("{}", bytes)
}

/// Build a k8s Quantity from a byte count
pub fn storage_quantity(bytes: i64) -> Quantity {
    Quantity(format_storage(bytes))
}

/// Read the `storage` entry of a resource map, in bytes.
///
/// Returns `Ok(None)` when the map or the entry is absent.
pub fn storage_from_map(map: Option<&BTreeMap<String, Quantity>>) -> Result<Option<i64>> {
    match map.and_then(|m| m.get(STORAGE_RESOURCE)) {
        Some(q) => parse_storage(&q.0).map(Some),
        None => Ok(None),
    }
}

/// Write the `storage` entry of a resource map
pub fn set_storage_in_map(map: &mut Option<BTreeMap<String, Quantity>>, bytes: i64) {
    map.get_or_insert_with(BTreeMap::new)
        .insert(STORAGE_RESOURCE.to_string(), storage_quantity(bytes));
}
