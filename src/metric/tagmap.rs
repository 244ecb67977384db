//! tagmap is the label set that rides along with every `TelemetryRecord`.
//! Think of it as a specialized map. Labels distinguish identically named
//! metrics: `http.requests{code="200"}` and `http.requests{code="500"}` are
//! different series.
//!
//! Pairs are kept sorted by key, so two maps built from the same pairs in any
//! order are identical, hash identically and serialize identically.

use serde::ser::{Serialize, Serializer};
use std::iter::FromIterator;
use std::slice::Iter;

/// The label key, value collection. Behaves like a small ordered map with
/// binary search over a sorted vector, which beats hashing for the handful of
/// labels a metric usually carries.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagMap {
    inner: Vec<(String, String)>,
}

impl TagMap {
    /// Iterate the pairs in key order.
    pub fn iter(&self) -> Iter<(String, String)> {
        self.inner.iter()
    }

    /// Get a value from the tagmap, if it exists.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.inner.binary_search_by(|probe| probe.0.as_str().cmp(key)) {
            Ok(idx) => Some(&self.inner[idx].1),
            Err(_) => None,
        }
    }

    /// Remove a value from the tagmap. The value will be returned if it
    /// existed.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        match self.inner.binary_search_by(|probe| probe.0.as_str().cmp(key)) {
            Ok(idx) => Some(self.inner.remove(idx).1),
            Err(_) => None,
        }
    }

    /// Insert a key / value into self
    ///
    /// This method will return the value previously stored under the given key,
    /// if there was such a value.
    pub fn insert<K, V>(&mut self, key: K, val: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        let val = val.into();
        match self.inner.binary_search_by(|probe| probe.0.cmp(&key)) {
            Ok(idx) => Some(::std::mem::replace(&mut self.inner[idx].1, val)),
            Err(idx) => {
                self.inner.insert(idx, (key, val));
                None
            }
        }
    }

    /// Determine if the tagmap is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Return the total number of key / values stored in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<K, V> FromIterator<(K, V)> for TagMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> TagMap {
        let mut map = TagMap::default();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<'a> IntoIterator for &'a TagMap {
    type Item = &'a (String, String);
    type IntoIter = Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl Serialize for TagMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.inner.iter().map(|&(ref k, ref v)| (k, v)))
    }
}
