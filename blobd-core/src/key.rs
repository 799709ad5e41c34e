//! Content-addressed identities: [`BlobKey`], [`BlobType`] and [`JobId`].

use crate::error::{BlobError, Result};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the content digest (SHA-1).
pub const DIGEST_SIZE: usize = 20;

/// Length of the random disambiguator.
pub const RANDOM_SIZE: usize = 16;

/// Length of a serialized key on the wire: digest, type byte, random.
pub const KEY_WIRE_SIZE: usize = DIGEST_SIZE + 1 + RANDOM_SIZE;

/// 16-byte identifier scoping permanent (and optionally transient) blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId([u8; JobId::SIZE]);

impl JobId {
    pub const SIZE: usize = 16;

    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_bytes())
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for JobId {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; Self::SIZE];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|error| {
                BlobError::InvalidRequest(format!("invalid job id '{}': {}", s, error))
            })?;
        Ok(Self(bytes))
    }
}

/// Lifecycle class of a blob. The declaration order is the wire encoding and
/// the tie-break order of [`BlobKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobType {
    /// Job-scoped, made highly available, no local TTL.
    Permanent,
    /// TTL-bound, cached locally only.
    Transient,
}

impl BlobType {
    pub fn to_byte(self) -> u8 {
        match self {
            BlobType::Permanent => 0,
            BlobType::Transient => 1,
        }
    }

    pub fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlobType::Permanent),
            1 => Ok(BlobType::Transient),
            other => Err(BlobError::Protocol(format!(
                "invalid data received for the BLOB type: {}",
                other
            ))),
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            BlobType::Permanent => "p",
            BlobType::Transient => "t",
        }
    }
}

/// Immutable identity of a stored blob.
///
/// Equality covers every field, so two uploads of identical bytes get unequal
/// keys. Use [`BlobKey::same_content`] to compare only the digest. Ordering is
/// digest (unsigned lexicographic), then type, then random.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey {
    digest: [u8; DIGEST_SIZE],
    blob_type: BlobType,
    random: [u8; RANDOM_SIZE],
}

impl BlobKey {
    /// Key for `digest` with a freshly generated random component.
    pub fn new(blob_type: BlobType, digest: [u8; DIGEST_SIZE]) -> Self {
        Self::from_parts(blob_type, digest, ulid::Ulid::new().to_bytes())
    }

    pub fn from_parts(
        blob_type: BlobType,
        digest: [u8; DIGEST_SIZE],
        random: [u8; RANDOM_SIZE],
    ) -> Self {
        Self {
            digest,
            blob_type,
            random,
        }
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    pub fn blob_type(&self) -> BlobType {
        self.blob_type
    }

    pub fn random(&self) -> &[u8; RANDOM_SIZE] {
        &self.random
    }

    pub fn is_permanent(&self) -> bool {
        self.blob_type == BlobType::Permanent
    }

    pub fn is_transient(&self) -> bool {
        self.blob_type == BlobType::Transient
    }

    /// True when both keys name the same bytes, regardless of type or random.
    pub fn same_content(&self, other: &BlobKey) -> bool {
        self.digest == other.digest
    }

    pub fn to_bytes(&self) -> [u8; KEY_WIRE_SIZE] {
        let mut out = [0u8; KEY_WIRE_SIZE];
        out[..DIGEST_SIZE].copy_from_slice(&self.digest);
        out[DIGEST_SIZE] = self.blob_type.to_byte();
        out[DIGEST_SIZE + 1..].copy_from_slice(&self.random);
        out
    }

    pub fn from_bytes(bytes: &[u8; KEY_WIRE_SIZE]) -> Result<Self> {
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&bytes[..DIGEST_SIZE]);
        let blob_type = BlobType::from_byte(bytes[DIGEST_SIZE])?;
        let mut random = [0u8; RANDOM_SIZE];
        random.copy_from_slice(&bytes[DIGEST_SIZE + 1..]);
        Ok(Self::from_parts(blob_type, digest, random))
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; KEY_WIRE_SIZE];
        reader.read_exact(&mut bytes).await.map_err(|error| {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                BlobError::Protocol("read an incomplete BLOB key".to_string())
            } else {
                BlobError::Io(error)
            }
        })?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.blob_type.prefix(),
            hex::encode(self.digest),
            hex::encode(self.random)
        )
    }
}

impl FromStr for BlobKey {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BlobError::InvalidRequest(format!("invalid blob key '{}'", s));

        let mut parts = s.trim().splitn(3, '-');
        let blob_type = match parts.next() {
            Some("p") => BlobType::Permanent,
            Some("t") => BlobType::Transient,
            _ => return Err(invalid()),
        };

        let mut digest = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(parts.next().ok_or_else(invalid)?, &mut digest)
            .map_err(|_| invalid())?;

        let mut random = [0u8; RANDOM_SIZE];
        hex::decode_to_slice(parts.next().ok_or_else(invalid)?, &mut random)
            .map_err(|_| invalid())?;

        Ok(Self::from_parts(blob_type, digest, random))
    }
}
