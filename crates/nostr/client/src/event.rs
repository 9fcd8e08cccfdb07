//! Nostr events and inbound signature verification.
//!
//! The pool never signs anything. It only checks that events delivered by
//! relays carry a valid id and Schnorr signature before handing them to
//! subscribers, and that check goes through the [`EventVerifier`] seam so
//! callers can swap it out (or skip it with `skip_verify`).

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Message, XOnlyPublicKey, schnorr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while checking an event.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("verification error: {0}")]
    Verification(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

/// Decides whether an inbound event is delivered to subscribers.
///
/// Returning `false` drops the event; it is never treated as a connection error.
pub trait EventVerifier: Send + Sync {
    fn verify(&self, event: &Event) -> bool;
}

impl<F> EventVerifier for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn verify(&self, event: &Event) -> bool {
        self(event)
    }
}

/// NIP-01 verifier: recomputes the id and checks the BIP-340 signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchnorrVerifier;

impl EventVerifier for SchnorrVerifier {
    fn verify(&self, event: &Event) -> bool {
        verify_event(event).unwrap_or(false)
    }
}

/// Serialize the signed fields of an event for hashing.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &Event) -> Result<String, EventError> {
    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))
}

/// Compute the event id from the signed fields.
pub fn event_hash(event: &Event) -> Result<String, EventError> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Verify an event's id and signature.
pub fn verify_event(event: &Event) -> Result<bool, EventError> {
    if !is_lower_hex(&event.id, 64) || !is_lower_hex(&event.pubkey, 64) || !is_lower_hex(&event.sig, 128)
    {
        return Ok(false);
    }

    if event_hash(event)? != event.id {
        return Ok(false);
    }

    let secp = Secp256k1::verification_only();

    let id_bytes = hex::decode(&event.id)
        .map_err(|e| EventError::Verification(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Verification(format!("invalid message: {}", e)))?;

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| EventError::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| EventError::Verification(format!("invalid signature: {}", e)))?;

    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| EventError::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::Verification(format!("invalid pubkey: {}", e)))?;

    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}
