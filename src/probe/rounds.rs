//! In-flight ICMP round bookkeeping.
//!
//! Every round sent by the ICMP prober opens an entry keyed by its round
//! counter and send instant. Replies acknowledge targets in the entry, the
//! periodic sweep expires whatever is left once the round outlives the
//! timeout. A target is acknowledged at most once per round, whichever side
//! gets there first.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// A target taking part in a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTarget {
    pub key: String,
    pub addr: IpAddr,
}

impl RoundTarget {
    pub fn new(key: impl Into<String>, addr: IpAddr) -> Self {
        Self {
            key: key.into(),
            addr,
        }
    }
}

/// A reply matched to an open round.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledged {
    pub key: String,
    pub sent_at: DateTime<Utc>,
    pub rtt: Duration,
}

/// A target whose round closed without a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Expired {
    pub key: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RoundKey {
    counter: u64,
    sent: Instant,
}

impl RoundKey {
    /// The 16-bit sequence number carried on the wire.
    fn sequence(&self) -> u16 {
        self.counter as u16
    }
}

#[derive(Debug)]
struct Pending {
    key: String,
    addr: IpAddr,
    acked: bool,
}

#[derive(Debug)]
struct Round {
    sent_at: DateTime<Utc>,
    targets: Vec<Pending>,
}

impl Round {
    fn settled(&self) -> bool {
        self.targets.iter().all(|t| t.acked)
    }

    fn expire(self) -> impl Iterator<Item = Expired> {
        let sent_at = self.sent_at;
        self.targets
            .into_iter()
            .filter(|t| !t.acked)
            .map(move |t| Expired { key: t.key, sent_at })
    }
}

/// Open rounds, oldest first.
#[derive(Debug, Default)]
pub struct RoundTable {
    rounds: BTreeMap<RoundKey, Round>,
}

impl RoundTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open rounds.
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Open a round.
    ///
    /// A still-open round with the same wire sequence is expired first, so
    /// a reply can never be credited to a round from a previous wrap of the
    /// counter.
    pub fn open(
        &mut self,
        counter: u64,
        sent: Instant,
        sent_at: DateTime<Utc>,
        targets: &[RoundTarget],
    ) -> Vec<Expired> {
        let sequence = counter as u16;
        let stale: Vec<RoundKey> = self
            .rounds
            .keys()
            .filter(|k| k.sequence() == sequence)
            .copied()
            .collect();

        let mut expired = Vec::new();
        for key in stale {
            if let Some(round) = self.rounds.remove(&key) {
                expired.extend(round.expire());
            }
        }

        if targets.is_empty() {
            return expired;
        }

        let round = Round {
            sent_at,
            targets: targets
                .iter()
                .map(|t| Pending {
                    key: t.key.clone(),
                    addr: t.addr,
                    acked: false,
                })
                .collect(),
        };
        self.rounds.insert(RoundKey { counter, sent }, round);
        expired
    }

    /// Credit a reply with `sequence` from `from` received at `now`.
    ///
    /// Returns the targets acknowledged by this reply; empty when the reply
    /// matches nothing or only already-acknowledged targets.
    pub fn acknowledge(&mut self, sequence: u16, from: IpAddr, now: Instant) -> Vec<Acknowledged> {
        let Some(key) = self
            .rounds
            .keys()
            .rev()
            .find(|k| k.sequence() == sequence)
            .copied()
        else {
            return Vec::new();
        };

        let Some(round) = self.rounds.get_mut(&key) else {
            return Vec::new();
        };

        let rtt = now.saturating_duration_since(key.sent);
        let sent_at = round.sent_at;
        let acked: Vec<Acknowledged> = round
            .targets
            .iter_mut()
            .filter(|t| t.addr == from && !t.acked)
            .map(|t| {
                t.acked = true;
                Acknowledged {
                    key: t.key.clone(),
                    sent_at,
                    rtt,
                }
            })
            .collect();

        if round.settled() {
            self.rounds.remove(&key);
        }
        acked
    }

    /// Mark `key` in round `counter` as accounted for without a reply.
    ///
    /// Returns false when the target was already acknowledged or the round
    /// is gone.
    pub fn settle(&mut self, counter: u64, key: &str) -> bool {
        let Some(round_key) = self.rounds.keys().find(|k| k.counter == counter).copied() else {
            return false;
        };
        let Some(round) = self.rounds.get_mut(&round_key) else {
            return false;
        };

        let mut changed = false;
        for target in round.targets.iter_mut().filter(|t| t.key == key && !t.acked) {
            target.acked = true;
            changed = true;
        }

        if round.settled() {
            self.rounds.remove(&round_key);
        }
        changed
    }

    /// Close every round older than `timeout` as of `now`.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Expired> {
        let old: Vec<RoundKey> = self
            .rounds
            .keys()
            .filter(|k| now.saturating_duration_since(k.sent) >= timeout)
            .copied()
            .collect();

        let mut expired = Vec::new();
        for key in old {
            if let Some(round) = self.rounds.remove(&key) {
                expired.extend(round.expire());
            }
        }
        expired
    }

    /// Close every open round regardless of age.
    pub fn close_all(&mut self) -> Vec<Expired> {
        std::mem::take(&mut self.rounds)
            .into_values()
            .flat_map(Round::expire)
            .collect()
    }
}
