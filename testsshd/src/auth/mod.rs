use std::collections::BTreeMap;

use russh::keys::PublicKey;

/// Public keys accepted by the server, keyed by label.
///
/// Read-only after construction and shared by every connection handler.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeySet {
    keys: BTreeMap<String, PublicKey>,
}

impl AuthorizedKeySet {
    pub fn new(keys: impl IntoIterator<Item = (String, PublicKey)>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Accept iff `candidate` has the same key data as a provisioned key.
    /// Comments are not part of the comparison.
    pub fn authorize(&self, candidate: &PublicKey) -> bool {
        self.matching_label(candidate).is_some()
    }

    /// Label of the provisioned key `candidate` matches, for logging.
    pub fn matching_label(&self, candidate: &PublicKey) -> Option<&str> {
        self.keys
            .iter()
            .find(|(_, key)| key.key_data() == candidate.key_data())
            .map(|(label, _)| label.as_str())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
