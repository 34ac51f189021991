//! Content hash types: hash algorithms, full content hashes and short index hashes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of every supported digest.
pub const HASH_LENGTH: usize = 32;

/// Number of digest bytes kept by a [`ShortHash`].
pub const SHORT_HASH_LENGTH: usize = 10;

/// Length of the textual hash-type tag (`SHA2`, `BLK3`).
pub const HASH_TAG_LENGTH: usize = 4;

/// Hash algorithm used to address content.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    /// SHA-256.
    #[default]
    Sha256,
    /// BLAKE3 with the default 32-byte output.
    Blake3,
}

impl HashType {
    /// Every supported hash type.
    pub const ALL: [HashType; 2] = [HashType::Sha256, HashType::Blake3];

    /// Fixed four-character tag used in string forms and database keys.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA2",
            Self::Blake3 => "BLK3",
        }
    }

    /// Parse a four-character tag.
    pub fn from_tag(tag: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| crate::Error::UnknownHashType(tag.to_string()))
    }

    /// Create an incremental hasher for this algorithm.
    pub fn hasher(self) -> ContentHasher {
        ContentHasher::new(self)
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A content hash: algorithm tag plus 32-byte digest.
///
/// The string form is `TAG:<64 lowercase hex chars>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash {
    hash_type: HashType,
    bytes: [u8; HASH_LENGTH],
}

impl ContentHash {
    /// Create a ContentHash from raw digest bytes.
    pub fn new(hash_type: HashType, bytes: [u8; HASH_LENGTH]) -> Self {
        Self { hash_type, bytes }
    }

    /// Hash `data` with the given algorithm.
    pub fn compute(hash_type: HashType, data: &[u8]) -> Self {
        let mut hasher = hash_type.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// The algorithm that produced this hash.
    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// Get the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.bytes
    }

    /// Encode the digest as lowercase hex (without the type tag).
    pub fn to_hex(&self) -> String {
        encode_hex(&self.bytes)
    }

    /// Project to the short form used as an index key.
    pub fn to_short_hash(&self) -> ShortHash {
        ShortHash::from_content_hash(self)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ContentHash({}:{})",
            self.hash_type.tag(),
            &self.to_hex()[..16]
        )
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_type.tag(), self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let (tag, hex) = s
            .split_once(':')
            .ok_or_else(|| crate::Error::InvalidHash(format!("missing type tag: {s}")))?;
        let hash_type = HashType::from_tag(tag)?;
        let mut bytes = [0u8; HASH_LENGTH];
        decode_hex(hex, &mut bytes)?;
        Ok(Self { hash_type, bytes })
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

/// Incremental hasher producing a [`ContentHash`].
pub struct ContentHasher(HasherState);

enum HasherState {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl ContentHasher {
    /// Create a hasher for the given algorithm.
    pub fn new(hash_type: HashType) -> Self {
        match hash_type {
            HashType::Sha256 => Self(HasherState::Sha256(Sha256::new())),
            HashType::Blake3 => Self(HasherState::Blake3(Box::new(blake3::Hasher::new()))),
        }
    }

    /// The algorithm of this hasher.
    pub fn hash_type(&self) -> HashType {
        match self.0 {
            HasherState::Sha256(_) => HashType::Sha256,
            HasherState::Blake3(_) => HashType::Blake3,
        }
    }

    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        match self.0 {
            HasherState::Sha256(hasher) => ContentHash::new(HashType::Sha256, hasher.finalize().into()),
            HasherState::Blake3(hasher) => {
                ContentHash::new(HashType::Blake3, *hasher.finalize().as_bytes())
            }
        }
    }
}

/// A truncated projection of a [`ContentHash`] used as a database index key.
///
/// Keeps the hash type and the first [`SHORT_HASH_LENGTH`] digest bytes. The
/// string form `TAG:<20 hex chars>` is exactly [`ShortHash::STRING_LENGTH`]
/// characters and is the on-disk key of the content location database, so
/// changing it is a breaking change.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ShortHash {
    hash_type: HashType,
    prefix: [u8; SHORT_HASH_LENGTH],
}

impl ShortHash {
    /// Length of the string form.
    pub const STRING_LENGTH: usize = HASH_TAG_LENGTH + 1 + SHORT_HASH_LENGTH * 2;

    /// Truncate a full content hash.
    pub fn from_content_hash(hash: &ContentHash) -> Self {
        let mut prefix = [0u8; SHORT_HASH_LENGTH];
        prefix.copy_from_slice(&hash.as_bytes()[..SHORT_HASH_LENGTH]);
        Self {
            hash_type: hash.hash_type(),
            prefix,
        }
    }

    /// The algorithm of the underlying hash.
    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// The retained digest prefix.
    pub fn prefix(&self) -> &[u8; SHORT_HASH_LENGTH] {
        &self.prefix
    }

    /// Whether `hash` projects to this short hash.
    pub fn matches(&self, hash: &ContentHash) -> bool {
        hash.hash_type() == self.hash_type && hash.as_bytes()[..SHORT_HASH_LENGTH] == self.prefix
    }

    /// Encode the prefix as lowercase hex (without the type tag).
    pub fn to_hex(&self) -> String {
        encode_hex(&self.prefix)
    }
}

impl From<&ContentHash> for ShortHash {
    fn from(hash: &ContentHash) -> Self {
        Self::from_content_hash(hash)
    }
}

impl From<ContentHash> for ShortHash {
    fn from(hash: ContentHash) -> Self {
        Self::from_content_hash(&hash)
    }
}

impl fmt::Debug for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortHash({self})")
    }
}

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash_type.tag(), self.to_hex())
    }
}

impl FromStr for ShortHash {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        if s.len() != Self::STRING_LENGTH {
            return Err(crate::Error::InvalidHash(format!(
                "short hash must be {} chars, got {}",
                Self::STRING_LENGTH,
                s.len()
            )));
        }
        let (tag, hex) = s
            .split_once(':')
            .ok_or_else(|| crate::Error::InvalidHash(format!("missing type tag: {s}")))?;
        let hash_type = HashType::from_tag(tag)?;
        let mut prefix = [0u8; SHORT_HASH_LENGTH];
        decode_hex(hex, &mut prefix)?;
        Ok(Self { hash_type, prefix })
    }
}

impl From<ShortHash> for String {
    fn from(hash: ShortHash) -> Self {
        hash.to_string()
    }
}

impl TryFrom<String> for ShortHash {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str, out: &mut [u8]) -> crate::Result<()> {
    if s.len() != out.len() * 2 {
        return Err(crate::Error::InvalidHash(format!(
            "expected {} hex chars, got {}",
            out.len() * 2,
            s.len()
        )));
    }
    if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(crate::Error::InvalidHash(format!("not hex: {s}")));
    }
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hex_str =
            std::str::from_utf8(chunk).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        out[i] = u8::from_str_radix(hex_str, 16)
            .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample(seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..64)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn test_content_hash_roundtrip() {
        for hash_type in HashType::ALL {
            let hash = ContentHash::compute(hash_type, b"hello world");
            let parsed: ContentHash = hash.to_string().parse().unwrap();
            assert_eq!(hash, parsed);
            assert!(hash.to_string().starts_with(hash_type.tag()));
        }
    }

    #[test]
    fn test_known_sha256_digest() {
        let hash = ContentHash::compute(HashType::Sha256, b"hello world");
        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_incremental_hasher_matches_one_shot() {
        for hash_type in HashType::ALL {
            let mut hasher = hash_type.hasher();
            hasher.update(b"hello ");
            hasher.update(b"world");
            assert_eq!(
                hasher.finalize(),
                ContentHash::compute(hash_type, b"hello world")
            );
        }
    }

    #[test]
    fn test_short_hash_string_roundtrip() {
        for seed in 0..256 {
            for hash_type in HashType::ALL {
                let hash = ContentHash::compute(hash_type, &sample(seed));
                let short = ShortHash::from(&hash);
                let text = short.to_string();
                assert_eq!(text.len(), ShortHash::STRING_LENGTH);
                let parsed: ShortHash = text.parse().unwrap();
                assert_eq!(parsed, short);
            }
        }
    }

    #[test]
    fn test_short_hash_string_is_25_chars_and_differs_from_full_hash() {
        let hash = ContentHash::compute(HashType::Sha256, b"data");
        let short = hash.to_short_hash();
        assert_eq!(short.to_string().len(), 25);
        assert_ne!(short.to_string(), hash.to_string());
        assert!(hash.to_string().starts_with(&short.to_string()));
    }

    #[test]
    fn test_short_hash_equality_and_hashing() {
        let hash = ContentHash::compute(HashType::Blake3, b"same content");
        let a = ShortHash::from(&hash);
        let b = ShortHash::from(hash);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(a.matches(&hash));
    }

    #[test]
    fn test_short_hash_distinguishes_hash_types() {
        let sha = ContentHash::compute(HashType::Sha256, b"x").to_short_hash();
        let blake = ContentHash::compute(HashType::Blake3, b"x").to_short_hash();
        assert_ne!(sha, blake);
        assert_ne!(sha.to_string()[..4], blake.to_string()[..4]);
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!("SHA2:abc".parse::<ShortHash>().is_err());
        assert!("XXXX:00112233445566778899".parse::<ShortHash>().is_err());
        assert!("SHA2:0011223344556677889g".parse::<ShortHash>().is_err());
        assert!("SHA2-00112233445566778899".parse::<ShortHash>().is_err());
        assert!("SHA2:+0112233445566778899".parse::<ShortHash>().is_err());
        assert!("nothex".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let hash = ContentHash::compute(HashType::Sha256, b"serde");
        let json = serde_json::to_string(&hash.to_short_hash()).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_short_hash()));
        let back: ShortHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash.to_short_hash());

        let json = serde_json::to_string(&hash).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
