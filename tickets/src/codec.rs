//! Ticket ID generation and storage encoding.
//!
//! # IDs
//!
//! IDs have the shape `<PREFIX>-<sequence>-<random>[-<node>]`. The random part
//! is lowercase hex, so it never contains the `-` separator, and comes from the
//! operating system CSPRNG with at least 128 bits, so
//! guessing a live ID is as hard as a brute-force key search. The sequence only
//! helps operators correlate log lines.
//!
//! # Encoding
//!
//! Backends that are plain key/value stores keep tickets as opaque blobs.
//! [`TicketCodec`] maps a ticket to an `(encoded id, blob)` pair and back:
//!
//! - [`PlainTicketCodec`]: bincode payload, ID stored as-is
//! - [`SealedTicketCodec`]: AES-256-GCM payload, ID replaced by its SHA-256
//!   digest so the backend never sees presentable ticket IDs
//!
//! Decoding fails with `TicketError::CorruptTicket` on malformed or tampered
//! input. It never fails because a ticket is expired; expiry is checked after
//! decoding.

use crate::config::IdGeneratorConfig;
use crate::error::{Result, TicketError};
use crate::ticket::{Ticket, TicketId, TicketKind};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

// ═══════════════════════════════════════════════════════════════════════
// ID Generation
// ═══════════════════════════════════════════════════════════════════════

/// Generates unguessable ticket IDs.
///
/// Clones share the sequence counter.
#[derive(Debug, Clone)]
pub struct TicketIdGenerator {
    config: IdGeneratorConfig,
    sequence: Arc<AtomicU64>,
}

impl TicketIdGenerator {
    /// Create a generator.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::InvalidConfiguration` if the random portion would
    /// carry less than 128 bits or the node suffix is not URL-safe.
    pub fn new(config: IdGeneratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sequence: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Generate a fresh ID for a ticket of `kind`.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::InvalidTicket` if the assembled ID does not parse,
    /// which only happens with a misconfigured suffix.
    pub fn new_ticket_id(&self, kind: TicketKind) -> Result<TicketId> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut random = vec![0u8; self.config.random_bytes];
        OsRng.fill_bytes(&mut random);
        let token = hex::encode(&random);

        let raw = match &self.config.node_suffix {
            Some(suffix) => format!("{}-{sequence}-{token}-{suffix}", kind.prefix()),
            None => format!("{}-{sequence}-{token}", kind.prefix()),
        };

        TicketId::parse(&raw)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Storage Encoding
// ═══════════════════════════════════════════════════════════════════════

/// A ticket in its storage representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTicket {
    /// Storage-safe ID; keeps the ticket type prefix.
    pub id: String,
    /// Opaque payload.
    pub blob: Vec<u8>,
}

/// Symmetric ticket encoding for opaque backends.
pub trait TicketCodec: Send + Sync {
    /// Storage ID for a presented ticket ID.
    fn encode_id(&self, id: &TicketId) -> String;

    /// Encode a ticket.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::CorruptTicket` if serialization or sealing fails.
    fn encode(&self, ticket: &Ticket) -> Result<EncodedTicket>;

    /// Decode a ticket.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::CorruptTicket` if the payload is malformed,
    /// tampered with, or does not belong to `encoded.id`.
    fn decode(&self, encoded: &EncodedTicket) -> Result<Ticket>;
}

/// Bincode codec without encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTicketCodec;

impl TicketCodec for PlainTicketCodec {
    fn encode_id(&self, id: &TicketId) -> String {
        id.as_str().to_string()
    }

    fn encode(&self, ticket: &Ticket) -> Result<EncodedTicket> {
        let blob = bincode::serialize(ticket).map_err(|e| TicketError::corrupt(e.to_string()))?;
        Ok(EncodedTicket {
            id: self.encode_id(ticket.id()),
            blob,
        })
    }

    fn decode(&self, encoded: &EncodedTicket) -> Result<Ticket> {
        let ticket: Ticket =
            bincode::deserialize(&encoded.blob).map_err(|e| TicketError::corrupt(e.to_string()))?;

        if ticket.id().as_str() != encoded.id {
            return Err(TicketError::corrupt(format!(
                "payload belongs to {} but was stored under {}",
                ticket.id(),
                encoded.id
            )));
        }

        Ok(ticket)
    }
}

/// AES-256-GCM codec with digested IDs.
///
/// The encoded ID is bound to the ciphertext as associated data, so a payload
/// copied under another key fails to decrypt.
#[derive(Clone)]
pub struct SealedTicketCodec {
    /// Wrapped in Arc so clones share one cipher instance.
    cipher: Arc<Aes256Gcm>,
}

impl SealedTicketCodec {
    /// Create a sealed codec.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::InvalidConfiguration` unless `key` is exactly
    /// 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(TicketError::InvalidConfiguration(
                "encryption key must be exactly 32 bytes (256 bits) for AES-256-GCM".to_string(),
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| {
            TicketError::InvalidConfiguration(format!("failed to initialize AES-256-GCM: {e}"))
        })?;

        Ok(Self {
            cipher: Arc::new(cipher),
        })
    }
}

impl fmt::Debug for SealedTicketCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedTicketCodec").finish_non_exhaustive()
    }
}

impl TicketCodec for SealedTicketCodec {
    fn encode_id(&self, id: &TicketId) -> String {
        let digest = Sha256::digest(id.as_str().as_bytes());
        format!("{}-{}", id.kind().prefix(), hex::encode(digest))
    }

    fn encode(&self, ticket: &Ticket) -> Result<EncodedTicket> {
        let id = self.encode_id(ticket.id());
        let plaintext =
            bincode::serialize(ticket).map_err(|e| TicketError::corrupt(e.to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: id.as_bytes(),
                },
            )
            .map_err(|e| TicketError::corrupt(format!("encryption failed: {e}")))?;

        // Format: [nonce (12 bytes)][ciphertext (variable)]
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(EncodedTicket { id, blob })
    }

    fn decode(&self, encoded: &EncodedTicket) -> Result<Ticket> {
        if encoded.blob.len() <= NONCE_LEN {
            return Err(TicketError::corrupt("sealed payload too short"));
        }

        let (nonce_bytes, ciphertext) = encoded.blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: encoded.id.as_bytes(),
                },
            )
            .map_err(|_| TicketError::corrupt("payload failed authentication"))?;

        let ticket: Ticket =
            bincode::deserialize(&plaintext).map_err(|e| TicketError::corrupt(e.to_string()))?;

        let expected = self.encode_id(ticket.id());
        if !constant_time_eq::constant_time_eq(expected.as_bytes(), encoded.id.as_bytes()) {
            return Err(TicketError::corrupt("payload does not match its storage ID"));
        }

        Ok(ticket)
    }
}
