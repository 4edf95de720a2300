//! Resource property bags.

use std::collections::BTreeMap;

/// A single property value.
pub type PropertyValue = serde_json::Value;

/// Inputs or outputs of a resource, ordered by key.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Top-level keys whose values differ between two maps, in key order.
pub fn changed_keys(old: &PropertyMap, new: &PropertyMap) -> Vec<String> {
    let mut keys: Vec<String> = old
        .iter()
        .filter(|(key, value)| new.get(*key) != Some(value))
        .map(|(key, _)| key.clone())
        .collect();
    keys.extend(
        new.keys()
            .filter(|key| !old.contains_key(*key))
            .cloned(),
    );
    keys.sort();
    keys
}

/// Build a map from `(key, value)` pairs.
pub fn property_map<K, V, I>(pairs: I) -> PropertyMap
where
    K: Into<String>,
    V: Into<PropertyValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}
