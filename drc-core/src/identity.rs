// ABOUTME: Per-channel participant identity tracker keyed by live nick.
// ABOUTME: Records rename history per identity and carries it across full roster resyncs.

use std::collections::{HashMap, VecDeque};

/// One living participant. Names are kept most-recent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NickIdentity {
    names: VecDeque<String>,
}

impl NickIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let mut names = VecDeque::new();
        names.push_front(name.into());
        Self { names }
    }

    pub fn current(&self) -> &str {
        // An identity is never constructed without a name and history only grows.
        self.names.front().map(String::as_str).unwrap_or_default()
    }

    /// Record a new current name. No-op when `name` already is the current one.
    pub fn add(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.current() == name {
            return false;
        }
        self.names.push_front(name);
        true
    }

    /// Full history, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn was_known_as(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// The live participants of one chat channel.
///
/// Every key equals the `current()` name of the identity stored under it.
#[derive(Debug, Clone, Default)]
pub struct ChannelIdentitySet {
    identities: HashMap<String, NickIdentity>,
}

impl ChannelIdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from an authoritative roster, seeding each name's history
    /// from `previous` when that exact name was live there.
    pub fn from_roster<I, S>(names: I, previous: Option<&ChannelIdentitySet>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for name in names {
            let name = name.into();
            let identity = previous
                .and_then(|prev| prev.identities.get(&name))
                .cloned()
                .unwrap_or_else(|| NickIdentity::new(name.clone()));
            set.identities.insert(name, identity);
        }
        set
    }

    pub fn has(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&NickIdentity> {
        self.identities.get(name)
    }

    /// History of the live identity currently named `name`, most recent first.
    pub fn history(&self, name: &str) -> Option<Vec<&str>> {
        self.identities.get(name).map(|id| id.history().collect())
    }

    /// Insert a fresh identity. Returns false if `name` is already live.
    pub fn add(&mut self, name: &str) -> bool {
        if self.identities.contains_key(name) {
            return false;
        }
        self.identities
            .insert(name.to_string(), NickIdentity::new(name));
        true
    }

    /// Move the identity live under `old` to `new`, recording `new` in its
    /// history. Returns false without touching anything if `old` is not live.
    ///
    /// Renaming onto a different live identity overwrites it.
    pub fn rename(&mut self, old: &str, new: &str) -> bool {
        let Some(mut identity) = self.identities.remove(old) else {
            return false;
        };
        identity.add(new);
        if let Some(displaced) = self.identities.insert(new.to_string(), identity) {
            tracing::debug!(
                old = %old,
                new = %new,
                displaced_history = ?displaced.history().collect::<Vec<_>>(),
                "Rename collided with a live identity; overwriting"
            );
        }
        true
    }

    /// Discard the identity live under `name`.
    pub fn remove(&mut self, name: &str) -> bool {
        self.identities.remove(name).is_some()
    }

    /// Current names of every live identity whose history contains `name`.
    pub fn was_known_as(&self, name: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .identities
            .iter()
            .filter(|(_, identity)| identity.was_known_as(name))
            .map(|(current, _)| current.clone())
            .collect();
        found.sort();
        found
    }

    /// Live names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.identities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_add_same_name_is_noop() {
        let mut id = NickIdentity::new("alice");
        assert!(!id.add("alice"));
        assert!(id.add("alice_"));
        assert!(id.add("alice"));
        assert_eq!(id.history().collect::<Vec<_>>(), vec!["alice", "alice_", "alice"]);
        assert_eq!(id.current(), "alice");
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut set = ChannelIdentitySet::new();
        assert!(set.add("alice"));
        assert!(!set.add("alice"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_rename_unknown_is_noop() {
        let mut set = ChannelIdentitySet::new();
        set.add("alice");
        assert!(!set.rename("bob", "carol"));
        assert_eq!(set.names(), vec!["alice"]);
        assert_eq!(set.history("alice"), Some(vec!["alice"]));
    }

    #[test]
    fn test_rename_chain_history() {
        let mut set = ChannelIdentitySet::new();
        set.add("A");
        assert!(set.rename("A", "B"));
        assert!(set.rename("B", "C"));
        assert!(set.rename("C", "D"));
        assert!(!set.has("A"));
        assert_eq!(set.history("D"), Some(vec!["D", "C", "B", "A"]));
    }

    #[test]
    fn test_roster_merge_preserves_history() {
        let mut set = ChannelIdentitySet::new();
        set.add("A");
        set.add("zed");
        set.rename("A", "B");
        set.rename("B", "C");
        set.rename("C", "D");

        let merged = ChannelIdentitySet::from_roster(["D", "newcomer"], Some(&set));
        assert_eq!(merged.history("D"), Some(vec!["D", "C", "B", "A"]));
        assert_eq!(merged.history("newcomer"), Some(vec!["newcomer"]));
        assert!(!merged.has("zed"));
    }

    #[test]
    fn test_was_known_as() {
        let mut set = ChannelIdentitySet::new();
        set.add("alice");
        set.add("bob");
        set.rename("alice", "alice_away");

        assert_eq!(set.was_known_as("alice"), vec!["alice_away"]);
        assert!(set.was_known_as("nobody").is_empty());

        assert!(set.remove("alice_away"));
        assert!(set.was_known_as("alice").is_empty());
        assert!(!set.remove("alice_away"));
    }

    #[test]
    fn test_rename_collision_overwrites() {
        let mut set = ChannelIdentitySet::new();
        set.add("alice");
        set.add("bob");
        assert!(set.rename("alice", "bob"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.history("bob"), Some(vec!["bob", "alice"]));
    }

    #[test]
    fn test_has_matches_live_heads_under_random_ops() {
        let pool = ["a", "b", "c", "d", "e"];
        let mut set = ChannelIdentitySet::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..2000 {
            let x = pool[(next() % 5) as usize];
            let y = pool[(next() % 5) as usize];
            match next() % 3 {
                0 => {
                    set.add(x);
                }
                1 => {
                    let before = set.names();
                    if !set.rename(x, y) {
                        assert_eq!(set.names(), before);
                    }
                }
                _ => {
                    set.remove(x);
                }
            }

            for name in pool {
                let is_head = set
                    .identities
                    .values()
                    .any(|identity| identity.current() == name);
                assert_eq!(set.has(name), is_head, "name {name}");
            }
        }
    }
}
