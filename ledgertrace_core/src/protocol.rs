//! Record schema and the checksum convention.
//!
//! Every published record carries a `Checksum`: a ciphertext of a fixed
//! sentinel (encrypted by the author to its own key), the author's
//! signature over that ciphertext, and the author's public key. Readers
//! authenticate authorship from the checksum alone, without decrypting
//! any other field, and must do so before trusting anything else in the
//! record.
//!
//! Sensitive fields (identity, location history) are encrypted one by one
//! to the analysis authority's public key.

use crate::error::TraceError;
use crate::security::{Ciphertext, PublicKey, SecurityToolBox, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Plaintext encrypted into every checksum.
pub const CHECKSUM_SENTINEL: &str = "checksum";

/// Authorship proof attached to every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub ciphertext: Ciphertext,
    pub signature: Signature,
    pub key: PublicKey,
}

impl Checksum {
    /// Builds a checksum proving authorship by `security`'s identity.
    pub fn seal(security: &SecurityToolBox) -> Result<Self, TraceError> {
        let ciphertext = security.encrypt(CHECKSUM_SENTINEL.as_bytes(), &security.public_key())?;
        let signature = security.sign(&ciphertext);
        Ok(Self {
            ciphertext,
            signature,
            key: security.public_key(),
        })
    }

    /// True when the signature matches the embedded key.
    pub fn verify(&self) -> bool {
        SecurityToolBox::verify(&self.ciphertext, &self.signature, &self.key)
    }

    /// True when the checksum verifies and was made by `expected`.
    pub fn verify_from(&self, expected: &PublicKey) -> bool {
        &self.key == expected && self.verify()
    }
}

/// Records that carry a checksum block.
pub trait Authenticated {
    fn checksum(&self) -> &Checksum;

    /// Public key claimed by the record's author.
    fn author(&self) -> PublicKey {
        self.checksum().key
    }

    /// Verifies the checksum, turning failure into `TraceError::Verification`.
    fn authenticate(&self) -> Result<(), TraceError> {
        if self.checksum().verify() {
            Ok(())
        } else {
            Err(TraceError::Verification {
                author: self.author().to_string(),
            })
        }
    }
}

/// One position fix in a participant's movement history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    /// Simulation time in milliseconds
    pub at_ms: u64,
}

impl Sample {
    pub fn distance_sq(&self, other: &Sample) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// What a participant hands over for publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Samples gathered since the previous write
    pub history: Vec<Sample>,
}

/// Record an agent appends to its own channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub agent_public_key: PublicKey,
    /// JSON history encrypted to the analysis authority
    pub history: Ciphertext,
    pub checksum: Checksum,
}

impl AgentRecord {
    pub fn seal(
        security: &SecurityToolBox,
        snapshot: &Snapshot,
        authority: &PublicKey,
    ) -> Result<Self, TraceError> {
        let history = serde_json::to_vec(&snapshot.history)?;
        Ok(Self {
            id: snapshot.id.clone(),
            agent_public_key: security.public_key(),
            history: security.encrypt(&history, authority)?,
            checksum: Checksum::seal(security)?,
        })
    }

    /// Decrypts the history (only the authority's identity can).
    pub fn open_history(&self, authority: &SecurityToolBox) -> Result<Vec<Sample>, TraceError> {
        decrypt_history(authority, &self.history, &self.agent_public_key)
    }
}

impl Authenticated for AgentRecord {
    fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

/// Record a diagnostician publishes after a check-in.
///
/// Bundles the agent's encrypted histories without its bare identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub bundle: Vec<Ciphertext>,
    pub agent_public_key: PublicKey,
    pub checksum: Checksum,
}

impl AggregateRecord {
    pub fn seal(
        diagnostician: &SecurityToolBox,
        bundle: Vec<Ciphertext>,
        agent_public_key: PublicKey,
    ) -> Result<Self, TraceError> {
        Ok(Self {
            bundle,
            agent_public_key,
            checksum: Checksum::seal(diagnostician)?,
        })
    }

    /// Decrypts and concatenates every bundled history.
    pub fn open_bundle(&self, authority: &SecurityToolBox) -> Result<Vec<Sample>, TraceError> {
        let mut samples = Vec::new();
        for history in &self.bundle {
            samples.extend(decrypt_history(authority, history, &self.agent_public_key)?);
        }
        Ok(samples)
    }
}

impl Authenticated for AggregateRecord {
    fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

/// Possible-infection result on the shared notification log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub possible: Vec<String>,
    pub checksum: Checksum,
}

impl NotificationRecord {
    pub fn seal(notifier: &SecurityToolBox, possible: Vec<String>) -> Result<Self, TraceError> {
        Ok(Self {
            possible,
            checksum: Checksum::seal(notifier)?,
        })
    }
}

impl Authenticated for NotificationRecord {
    fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

/// Outcome of folding a batch of notification records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationScan {
    /// Deduplicated identifiers from verified records only (sorted)
    pub possible: Vec<String>,

    /// Records whose checksum verified
    pub verified: usize,

    /// Records discarded because the checksum failed or the author is not trusted
    pub rejected: usize,

    /// Roots whose payload was not a notification record
    pub undecodable: usize,
}

impl NotificationScan {
    /// True when nothing new was found (as opposed to new but untrusted).
    pub fn is_quiet(&self) -> bool {
        self.verified == 0 && self.rejected == 0 && self.undecodable == 0
    }

    pub fn names(&self, id: &str) -> bool {
        self.possible.iter().any(|p| p == id)
    }
}

/// Unions the `possible` field across records that pass verification.
///
/// When `trusted` is non-empty the author must also be listed there.
pub fn fold_notifications<'a, I>(records: I, trusted: &[PublicKey]) -> NotificationScan
where
    I: IntoIterator<Item = &'a NotificationRecord>,
{
    let mut possible = BTreeSet::new();
    let mut scan = NotificationScan::default();

    for record in records {
        let trusted_author = trusted.is_empty() || trusted.contains(&record.author());
        if record.checksum.verify() && trusted_author {
            scan.verified += 1;
            possible.extend(record.possible.iter().cloned());
        } else {
            scan.rejected += 1;
        }
    }

    scan.possible = possible.into_iter().collect();
    scan
}

fn decrypt_history(
    authority: &SecurityToolBox,
    history: &Ciphertext,
    sender: &PublicKey,
) -> Result<Vec<Sample>, TraceError> {
    let plaintext = authority.decrypt(history, sender)?;
    serde_json::from_slice(&plaintext).map_err(|e| TraceError::Decode {
        address: sender.to_string(),
        reason: e.to_string(),
    })
}
