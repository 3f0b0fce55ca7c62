// ABOUTME: Roster service keeping one ChannelIdentitySet per (network, channel) from IRC membership events.
// ABOUTME: Resolves stale nicks to current participants with explicit NotFound/Ambiguous results.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::envelope::{Envelope, EventKind};
use crate::identity::ChannelIdentitySet;
use crate::router::BusRouter;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RosterError {
    #[error("no live participant in {channel} matches '{name}'")]
    NotFound { channel: String, name: String },
    #[error("'{name}' in {channel} was used by several participants: {candidates:?}")]
    Ambiguous {
        channel: String,
        name: String,
        candidates: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ChannelMember {
    network: String,
    channel: String,
    nick: String,
}

#[derive(Debug, Deserialize)]
struct Quit {
    network: String,
    nick: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NickChange {
    network: String,
    old_nick: String,
    new_nick: String,
}

#[derive(Debug, Deserialize)]
struct Names {
    network: String,
    channel: String,
    nicks: Vec<String>,
}

type ChannelKey = (String, String);

/// Live participants of every channel the bridge sits in.
#[derive(Clone, Default)]
pub struct RosterService {
    channels: Arc<Mutex<HashMap<ChannelKey, ChannelIdentitySet>>>,
}

impl RosterService {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ChannelKey, ChannelIdentitySet>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(network: &str, channel: &str) -> ChannelKey {
        (network.to_string(), channel.to_string())
    }

    pub fn join(&self, network: &str, channel: &str, nick: &str) -> bool {
        self.table()
            .entry(Self::key(network, channel))
            .or_default()
            .add(nick)
    }

    /// Remove `nick` from one channel (part or kick).
    pub fn part(&self, network: &str, channel: &str, nick: &str) -> bool {
        self.table()
            .get_mut(&Self::key(network, channel))
            .is_some_and(|set| set.remove(nick))
    }

    /// Remove `nick` from every channel on `network`. Returns the channels it left.
    pub fn quit(&self, network: &str, nick: &str) -> Vec<String> {
        let mut left: Vec<String> = self
            .table()
            .iter_mut()
            .filter(|((net, _), _)| net == network)
            .filter_map(|((_, channel), set)| set.remove(nick).then(|| channel.clone()))
            .collect();
        left.sort();
        left
    }

    /// Apply a nick change in every channel on `network` where `old` is live.
    pub fn rename(&self, network: &str, old: &str, new: &str) -> Vec<String> {
        let mut renamed: Vec<String> = self
            .table()
            .iter_mut()
            .filter(|((net, _), _)| net == network)
            .filter_map(|((_, channel), set)| set.rename(old, new).then(|| channel.clone()))
            .collect();
        renamed.sort();
        renamed
    }

    /// Replace a channel's roster with an authoritative one, keeping the
    /// rename history of names that survive the resync.
    pub fn names<I, S>(&self, network: &str, channel: &str, nicks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut channels = self.table();
        let key = Self::key(network, channel);
        let refreshed = ChannelIdentitySet::from_roster(nicks, channels.get(&key));
        tracing::debug!(
            network = %network,
            channel = %channel,
            members = refreshed.len(),
            "Channel roster refreshed"
        );
        channels.insert(key, refreshed);
    }

    /// Map `name` to a live participant: the name itself if live, otherwise
    /// the single participant that was previously known by it.
    pub fn resolve(&self, network: &str, channel: &str, name: &str) -> Result<String, RosterError> {
        let channels = self.table();
        let not_found = || RosterError::NotFound {
            channel: channel.to_string(),
            name: name.to_string(),
        };
        let set = channels.get(&Self::key(network, channel)).ok_or_else(not_found)?;
        if set.has(name) {
            return Ok(name.to_string());
        }

        let mut candidates = set.was_known_as(name);
        match candidates.len() {
            0 => Err(not_found()),
            1 => Ok(candidates.remove(0)),
            _ => Err(RosterError::Ambiguous {
                channel: channel.to_string(),
                name: name.to_string(),
                candidates,
            }),
        }
    }

    pub fn members(&self, network: &str, channel: &str) -> Vec<String> {
        self.table()
            .get(&Self::key(network, channel))
            .map(ChannelIdentitySet::names)
            .unwrap_or_default()
    }

    pub fn history(&self, network: &str, channel: &str, nick: &str) -> Option<Vec<String>> {
        self.table()
            .get(&Self::key(network, channel))?
            .history(nick)
            .map(|names| names.into_iter().map(str::to_string).collect())
    }

    /// Channels tracked on `network`, sorted.
    pub fn channels(&self, network: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .table()
            .keys()
            .filter(|(net, _)| net == network)
            .map(|(_, channel)| channel.clone())
            .collect();
        found.sort();
        found
    }

    /// Apply one membership envelope. Returns false for tags this service
    /// does not track.
    pub fn apply(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        match envelope.kind() {
            EventKind::IrcJoin => {
                let m: ChannelMember = envelope.data_as()?;
                self.join(&m.network, &m.channel, &m.nick);
            }
            EventKind::IrcPart | EventKind::IrcKick => {
                let m: ChannelMember = envelope.data_as()?;
                if !self.part(&m.network, &m.channel, &m.nick) {
                    tracing::debug!(
                        network = %m.network,
                        channel = %m.channel,
                        nick = %m.nick,
                        "Departure for a nick that was not tracked"
                    );
                }
            }
            EventKind::IrcQuit => {
                let q: Quit = envelope.data_as()?;
                self.quit(&q.network, &q.nick);
            }
            EventKind::IrcNick => {
                let n: NickChange = envelope.data_as()?;
                let channels = self.rename(&n.network, &n.old_nick, &n.new_nick);
                if channels.is_empty() {
                    tracing::debug!(
                        network = %n.network,
                        old = %n.old_nick,
                        new = %n.new_nick,
                        "Nick change for a nick not live in any tracked channel"
                    );
                }
            }
            EventKind::IrcNames => {
                let n: Names = envelope.data_as()?;
                self.names(&n.network, &n.channel, n.nicks);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Register this service on `router` for every membership tag.
    pub fn attach(&self, router: BusRouter) -> BusRouter {
        [
            EventKind::IrcJoin,
            EventKind::IrcPart,
            EventKind::IrcKick,
            EventKind::IrcQuit,
            EventKind::IrcNick,
            EventKind::IrcNames,
        ]
        .iter()
        .fold(router, |router, kind| {
            let roster = self.clone();
            router.on(kind.tag(), move |envelope: Envelope| {
                let roster = roster.clone();
                async move {
                    roster.apply(&envelope)?;
                    anyhow::Ok(())
                }
            })
        })
    }
}

impl std::fmt::Debug for RosterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterService")
            .field("channels", &self.table().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quit_and_nick_span_channels() {
        let roster = RosterService::new();
        roster.join("libera", "#rust", "alice");
        roster.join("libera", "#tokio", "alice");
        roster.join("oftc", "#rust", "alice");

        assert_eq!(roster.rename("libera", "alice", "alice_"), vec!["#rust", "#tokio"]);
        assert_eq!(roster.members("oftc", "#rust"), vec!["alice"]);

        assert_eq!(roster.quit("libera", "alice_"), vec!["#rust", "#tokio"]);
        assert!(roster.members("libera", "#rust").is_empty());
        assert_eq!(roster.channels("libera"), vec!["#rust", "#tokio"]);
    }

    #[test]
    fn test_resolve_stale_nick() {
        let roster = RosterService::new();
        roster.join("libera", "#rust", "alice");
        roster.rename("libera", "alice", "alice_afk");

        assert_eq!(roster.resolve("libera", "#rust", "alice").unwrap(), "alice_afk");
        assert_eq!(roster.resolve("libera", "#rust", "alice_afk").unwrap(), "alice_afk");
        assert_eq!(
            roster.resolve("libera", "#rust", "bob"),
            Err(RosterError::NotFound {
                channel: "#rust".to_string(),
                name: "bob".to_string()
            })
        );
    }

    #[test]
    fn test_resolve_ambiguous() {
        let roster = RosterService::new();
        roster.join("libera", "#rust", "guest");
        roster.rename("libera", "guest", "carol");
        roster.join("libera", "#rust", "guest");
        roster.rename("libera", "guest", "dave");

        match roster.resolve("libera", "#rust", "guest") {
            Err(RosterError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates, vec!["carol", "dave"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_names_resync_keeps_history() {
        let roster = RosterService::new();
        roster.join("libera", "#rust", "A");
        roster.rename("libera", "A", "B");
        roster.rename("libera", "B", "C");
        roster.names("libera", "#rust", ["C", "zoe"]);

        assert_eq!(
            roster.history("libera", "#rust", "C"),
            Some(vec!["C".to_string(), "B".to_string(), "A".to_string()])
        );
        assert_eq!(roster.members("libera", "#rust"), vec!["C", "zoe"]);
    }
}
