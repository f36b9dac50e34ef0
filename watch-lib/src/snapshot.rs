use atoi::FromRadix10SignedChecked;
use bytes::Bytes;
use std::collections::HashMap;

/// Values read during one attempt, keyed by watched key.
///
/// Keys that were absent in the store hold the runner's default value, so
/// `get` only returns `None` for keys that were never watched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    values: HashMap<String, Bytes>,
}

impl Snapshot {
    pub(crate) fn with_capacity(capacity: usize) -> Snapshot {
        Snapshot {
            values: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, key: String, value: Bytes) {
        self.values.insert(key, value);
    }

    pub(crate) fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.values.get(key)
    }

    /// Decode the value at `key` as a signed integer, the way a counter is stored.
    pub fn int(&self, key: &str) -> crate::Result<i64> {
        let value = self
            .get(key)
            .ok_or_else(|| format!("key `{}` is not part of the snapshot", key))?;

        parse_int(value).ok_or_else(|| format!("value at `{}` is not an integer", key).into())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_inner(self) -> HashMap<String, Bytes> {
        self.values
    }
}

/// `atoi` stops at the first non-digit, so trailing garbage is rejected here.
pub(crate) fn parse_int(src: &[u8]) -> Option<i64> {
    match i64::from_radix_10_signed_checked(src) {
        (Some(n), used) if used == src.len() && used > 0 => Some(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_int_rejects_partial_numbers() {
        assert_eq!(parse_int(b"42"), Some(42));
        assert_eq!(parse_int(b"-7"), Some(-7));
        assert_eq!(parse_int(b"42abc"), None);
        assert_eq!(parse_int(b""), None);
        assert_eq!(parse_int(b"99999999999999999999"), None);
    }

    #[test]
    fn int_reports_missing_and_garbage() {
        let mut snapshot = Snapshot::default();
        snapshot.insert("n".into(), Bytes::from_static(b"10"));
        snapshot.insert("s".into(), Bytes::from_static(b"ten"));

        assert_eq!(snapshot.int("n").unwrap(), 10);
        assert!(snapshot.int("s").is_err());
        assert!(snapshot.int("missing").is_err());
    }
}
