//! Deferred-read bookkeeping for solid archives.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{InstallError, InstallResult};

use super::ReadOutcome;

/// Pending keys plus the bytes produced by previous linear passes.
///
/// Keys are stored lower-cased. A key that a pass failed to produce is
/// remembered as absent so later reads fail instead of deferring forever.
#[derive(Debug, Default)]
pub struct SolidCache {
    pending: BTreeSet<String>,
    loaded: HashMap<String, Vec<u8>>,
    absent: HashSet<String>,
    passes: usize,
}

impl SolidCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, key: &str) -> InstallResult<ReadOutcome> {
        let lower = key.to_lowercase();
        if let Some(data) = self.loaded.get(&lower) {
            return Ok(ReadOutcome::Ready(data.clone()));
        }
        if self.absent.contains(&lower) {
            return Err(InstallError::MissingContent(key.to_string()));
        }
        self.pending.insert(lower);
        Ok(ReadOutcome::Deferred)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of linear passes run so far
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Run `pass` once over the pending keys, if any.
    ///
    /// `pass` receives the wanted lower-cased keys and returns the entries it
    /// decoded as `(key, bytes)`.
    pub fn load_with<F>(&mut self, pass: F) -> InstallResult<()>
    where
        F: FnOnce(&BTreeSet<String>) -> InstallResult<Vec<(String, Vec<u8>)>>,
    {
        if self.pending.is_empty() {
            return Ok(());
        }
        let wanted = std::mem::take(&mut self.pending);
        self.passes += 1;

        let decoded = match pass(&wanted) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.pending = wanted;
                return Err(e);
            }
        };
        for (key, data) in decoded {
            self.loaded.insert(key.to_lowercase(), data);
        }
        for key in wanted {
            if !self.loaded.contains_key(&key) {
                self.absent.insert(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_archive() -> Vec<(String, Vec<u8>)> {
        vec![
            ("car/ui/ui_car.json".to_string(), b"{}".to_vec()),
            ("car/ui/badge.png".to_string(), b"png".to_vec()),
            ("car/data.acd".to_string(), b"acd".to_vec()),
        ]
    }

    fn linear_pass(wanted: &BTreeSet<String>) -> InstallResult<Vec<(String, Vec<u8>)>> {
        Ok(fake_archive()
            .into_iter()
            .filter(|(key, _)| wanted.contains(&key.to_lowercase()))
            .collect())
    }

    #[test]
    fn test_reads_defer_until_single_pass() {
        let mut cache = SolidCache::new();
        assert_eq!(cache.read("car/ui/ui_car.json").unwrap(), ReadOutcome::Deferred);
        assert_eq!(cache.read("CAR/UI/badge.png").unwrap(), ReadOutcome::Deferred);
        assert!(cache.has_pending());

        cache.load_with(linear_pass).unwrap();
        assert_eq!(cache.passes(), 1);
        assert!(!cache.has_pending());

        assert_eq!(
            cache.read("car/ui/ui_car.json").unwrap(),
            ReadOutcome::Ready(b"{}".to_vec())
        );
        assert_eq!(
            cache.read("car/ui/badge.png").unwrap(),
            ReadOutcome::Ready(b"png".to_vec())
        );
    }

    #[test]
    fn test_load_without_pending_is_noop() {
        let mut cache = SolidCache::new();
        cache
            .load_with(|_| panic!("pass must not run without pending keys"))
            .unwrap();
        assert_eq!(cache.passes(), 0);
    }

    #[test]
    fn test_absent_key_fails_after_pass() {
        let mut cache = SolidCache::new();
        cache.read("car/missing.ini").unwrap();
        cache.load_with(linear_pass).unwrap();
        assert!(matches!(
            cache.read("car/missing.ini"),
            Err(InstallError::MissingContent(_))
        ));
    }

    #[test]
    fn test_failed_pass_keeps_keys_pending() {
        let mut cache = SolidCache::new();
        cache.read("car/data.acd").unwrap();
        let result = cache.load_with(|_| Err(InstallError::PasswordIncorrect));
        assert!(result.is_err());
        assert!(cache.has_pending());
        cache.load_with(linear_pass).unwrap();
        assert_eq!(cache.passes(), 2);
        assert!(matches!(cache.read("car/data.acd").unwrap(), ReadOutcome::Ready(_)));
    }
}
