//! Filter policies summarize the keys of a table so reads can skip tables
//! that cannot contain a key. User-supplied policies see user keys; the
//! storage layer stores internal keys, and [`InternalFilterPolicy`] bridges
//! the two.

use crate::internal_key::extract_user_key;

/// Builds and probes per-table key filters (typically bloom filters).
pub trait FilterPolicy {
    fn name(&self) -> &'static str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Whether `key` may be present in `filter`. False positives are
    /// allowed; false negatives are not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Adapts a user-key policy to internal keys by stripping the tag off every
/// key before delegating. Carries no state of its own.
pub struct InternalFilterPolicy<P> {
    user: P,
}

impl<P: FilterPolicy> InternalFilterPolicy<P> {
    pub fn new(user: P) -> InternalFilterPolicy<P> {
        InternalFilterPolicy { user }
    }
}

impl<P: FilterPolicy> FilterPolicy for InternalFilterPolicy<P> {
    fn name(&self) -> &'static str {
        self.user.name()
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        let user_keys: Vec<&[u8]> = keys.iter().map(|key| extract_user_key(key)).collect();
        self.user.create_filter(&user_keys, dst);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.user.key_may_match(extract_user_key(key), filter)
    }
}
