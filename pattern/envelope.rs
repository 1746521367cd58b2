//! The transport format for partial results.
//!
//! Every value that leaves the partition that produced it, whether bound for
//! the master, a peer partition or a later job, travels as an [`Envelope`]:
//! the sender's index, a tag naming the payload type, and the payload bytes.
//! Opening an envelope always yields a freshly owned value, so nothing handed
//! out by one stage can alias state held by another.

use crate::types::PartitionIndex;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENVELOPE_MAGIC: [u8; 4] = *b"CLSE";
const ENVELOPE_VERSION: u16 = 1;
const HEADER_LEN: usize = ENVELOPE_MAGIC.len() + std::mem::size_of::<u16>();

/// A value that may cross a partition boundary.
///
/// `TAG` must be unique per payload type; it is checked on every unwrap.
pub trait Payload: Serialize + DeserializeOwned {
    const TAG: &'static str;
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Data is not a partial-result envelope.")]
    BadMagic,
    #[error("Envelope format version {0} is not supported.")]
    UnsupportedVersion(u16),
    #[error("Envelope carries '{found}' but '{expected}' was requested.")]
    TagMismatch { expected: &'static str, found: String },
    #[error("Failed to encode envelope contents: {0}")]
    Encode(#[source] bincode::Error),
    #[error("Envelope contents are corrupt: {0}")]
    Decode(#[source] bincode::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    partition: PartitionIndex,
    tag: String,
    payload: Vec<u8>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

impl Envelope {
    pub fn wrap<T: Payload>(value: &T, partition: PartitionIndex) -> Result<Self, EnvelopeError> {
        let payload = codec().serialize(value).map_err(EnvelopeError::Encode)?;
        Ok(Self {
            partition,
            tag: T::TAG.to_string(),
            payload,
        })
    }

    /// Decodes the payload into a new owned value, leaving the envelope intact.
    /// Used when one envelope is replicated to many receivers.
    pub fn open<T: Payload>(&self) -> Result<T, EnvelopeError> {
        if self.tag != T::TAG {
            return Err(EnvelopeError::TagMismatch {
                expected: T::TAG,
                found: self.tag.clone(),
            });
        }
        codec()
            .deserialize(&self.payload)
            .map_err(EnvelopeError::Decode)
    }

    pub fn unwrap<T: Payload>(self) -> Result<T, EnvelopeError> {
        self.open()
    }

    pub fn partition(&self) -> PartitionIndex {
        self.partition
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Frames the envelope for storage outside the process.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let body = codec().serialize(self).map_err(EnvelopeError::Encode)?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&ENVELOPE_MAGIC);
        bytes.extend_from_slice(&ENVELOPE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN || bytes[..ENVELOPE_MAGIC.len()] != ENVELOPE_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        codec()
            .deserialize(&bytes[HEADER_LEN..])
            .map_err(EnvelopeError::Decode)
    }
}
