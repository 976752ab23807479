//! One-time bridge signature-set keypairs
//!
//! Every inbound transfer posts its attestation through a fresh keypair.
//! When the inbound stage fails the keys are regenerated; the abandoned
//! public keys stay in `previous_addresses` so history scans still find
//! transactions signed by them. Keys themselves are never persisted.

use solana_sdk::signature::{Keypair, Signer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct SignatureSets {
    keypairs: BTreeMap<String, Arc<Keypair>>,
    previous_addresses: BTreeMap<String, Vec<String>>,
}

impl SignatureSets {
    /// Fresh keypair for each token id
    pub fn generate<I, S>(token_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keypairs = token_ids
            .into_iter()
            .map(|id| (id.into(), Arc::new(Keypair::new())))
            .collect();
        Self {
            keypairs,
            previous_addresses: BTreeMap::new(),
        }
    }

    pub fn with_previous_addresses(mut self, previous: BTreeMap<String, Vec<String>>) -> Self {
        for (token_id, addresses) in previous {
            let entry = self.previous_addresses.entry(token_id).or_default();
            for address in addresses {
                if !entry.contains(&address) {
                    entry.push(address);
                }
            }
        }
        self
    }

    /// Add keypairs for token ids that have none yet
    pub fn with_keys_for<I, S>(mut self, token_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in token_ids {
            self.keypairs
                .entry(id.into())
                .or_insert_with(|| Arc::new(Keypair::new()));
        }
        self
    }

    /// Replace every keypair; current addresses move to `previous_addresses`
    pub fn regenerate(&self) -> Self {
        let all: Vec<String> = self.keypairs.keys().cloned().collect();
        self.regenerate_only(all)
    }

    /// Replace the keypairs of `token_ids` only, keeping the others
    pub fn regenerate_only<I, S>(&self, token_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut previous_addresses = self.previous_addresses.clone();
        let mut keypairs = self.keypairs.clone();
        let mut replaced = 0;
        for token_id in token_ids {
            let token_id = token_id.into();
            let Some(keypair) = keypairs.get_mut(&token_id) else {
                continue;
            };
            let entry = previous_addresses.entry(token_id).or_default();
            let address = keypair.pubkey().to_string();
            if !entry.contains(&address) {
                entry.push(address);
            }
            *keypair = Arc::new(Keypair::new());
            replaced += 1;
        }
        log::debug!("regenerated {} signature set keypairs", replaced);
        Self {
            keypairs,
            previous_addresses,
        }
    }

    pub fn keypair(&self, token_id: &str) -> Option<Arc<Keypair>> {
        self.keypairs.get(token_id).cloned()
    }

    pub fn address(&self, token_id: &str) -> Option<String> {
        self.keypairs.get(token_id).map(|k| k.pubkey().to_string())
    }

    pub fn token_ids(&self) -> impl Iterator<Item = &str> {
        self.keypairs.keys().map(String::as_str)
    }

    pub fn previous_addresses(&self) -> &BTreeMap<String, Vec<String>> {
        &self.previous_addresses
    }

    /// Current address first, then every abandoned one
    pub fn known_addresses(&self, token_id: &str) -> Vec<String> {
        self.address(token_id)
            .into_iter()
            .chain(self.previous_addresses.get(token_id).into_iter().flatten().cloned())
            .collect()
    }

    /// Previous addresses with the current ones folded in, as stored on disk
    pub fn folded_addresses(&self) -> BTreeMap<String, Vec<String>> {
        let mut folded = self.previous_addresses.clone();
        for token_id in self.keypairs.keys() {
            if let Some(address) = self.address(token_id) {
                let entry = folded.entry(token_id.clone()).or_default();
                if !entry.contains(&address) {
                    entry.push(address);
                }
            }
        }
        folded
    }
}

impl PartialEq for SignatureSets {
    fn eq(&self, other: &Self) -> bool {
        self.previous_addresses == other.previous_addresses
            && self.keypairs.len() == other.keypairs.len()
            && self
                .keypairs
                .iter()
                .all(|(id, k)| other.keypairs.get(id).map(|o| o.pubkey()) == Some(k.pubkey()))
    }
}

impl fmt::Debug for SignatureSets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current: BTreeMap<&str, String> = self
            .keypairs
            .iter()
            .map(|(id, k)| (id.as_str(), k.pubkey().to_string()))
            .collect();
        f.debug_struct("SignatureSets")
            .field("current", &current)
            .field("previous_addresses", &self.previous_addresses)
            .finish()
    }
}
