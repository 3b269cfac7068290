//! # ConflictResolver
//!
//! Two offline devices can each hold an intent that looks like "the same"
//! payment: same sender, same recipient, same amount. Only one may settle.
//! Every device must pick the same one without talking to the others, so
//! the choice is a pure function of the intents themselves:
//!
//! 1. lower `nonce` wins;
//! 2. then earlier `created_at`;
//! 3. then the lexicographically smaller signature;
//! 4. then the smaller id (only reachable with identical signatures).
//!
//! The order is total, so any permutation of the input yields the same
//! winner.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::crypto::keys::PublicKey;
use crate::intent::Intent;

/// Intents sharing this key compete with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConflictKey {
    pub sender: PublicKey,
    pub recipient: PublicKey,
    pub amount: u64,
}

impl ConflictKey {
    pub fn of(intent: &Intent) -> Self {
        Self {
            sender: intent.sender,
            recipient: intent.recipient,
            amount: intent.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Intent,
    pub losers: Vec<Intent>,
}

/// The precedence order: `Less` means `a` beats `b`.
pub fn precedence(a: &Intent, b: &Intent) -> Ordering {
    a.nonce
        .cmp(&b.nonce)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.signature.as_bytes().cmp(b.signature.as_bytes()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick the winner among competing intents. `None` for an empty set.
pub fn resolve(intents: &[Intent]) -> Option<Resolution> {
    let mut sorted: Vec<Intent> = intents.to_vec();
    sorted.sort_by(precedence);
    let mut iter = sorted.into_iter();
    let winner = iter.next()?;
    Some(Resolution {
        winner,
        losers: iter.collect(),
    })
}

/// Bucket intents by conflict key. Key order is deterministic; within a
/// bucket, input order is kept.
pub fn group_conflicts<'a, I>(intents: I) -> BTreeMap<ConflictKey, Vec<Intent>>
where
    I: IntoIterator<Item = &'a Intent>,
{
    let mut groups: BTreeMap<ConflictKey, Vec<Intent>> = BTreeMap::new();
    for intent in intents {
        groups
            .entry(ConflictKey::of(intent))
            .or_default()
            .push(intent.clone());
    }
    groups
}
