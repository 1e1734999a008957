//! Identities and the references that point at feeds, messages and blobs.
//!
//! All references have a canonical string form made of a sigil, the base64 encoding of 32
//! bytes and an algorithm suffix:
//!
//! - feeds: `@<base64 public key>.ed25519`
//! - messages: `%<base64 sha256>.sha256`
//! - blobs: `&<base64 sha256>.sha256`
//!
//! The string form is also what they serialize to.

use std::{
    fmt::{self, Debug, Display},
    hash::Hash as _,
    str::FromStr,
};

use data_encoding::{BASE64, HEXLOWER};
use ed25519_dalek::VerifyingKey;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize, de};
use sha2::{Digest, Sha256};
use snafu::{Backtrace, ResultExt, Snafu};

/// Error when parsing any of the references of this module.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    #[snafu(display("expected a reference starting with '{expected}'"))]
    InvalidSigil { expected: char },
    #[snafu(display("missing algorithm suffix"))]
    MissingAlgo {},
    #[snafu(display("unknown algorithm: {algo}"))]
    UnknownAlgo { algo: String },
    #[snafu(display("invalid base64 encoding"))]
    InvalidEncoding { source: data_encoding::DecodeError },
    #[snafu(display("length must be 32 bytes, but got {len} byte(s)"))]
    InvalidLength { len: usize },
    #[snafu(display("not a valid ed25519 public key"))]
    InvalidKey {
        source: ed25519_dalek::SignatureError,
    },
}

fn decode_32(s: &str) -> Result<[u8; 32], ParseError> {
    let bytes = BASE64.decode(s.as_bytes()).context(InvalidEncodingSnafu)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| InvalidLengthSnafu { len }.build())
}

/// Splits `<sigil><body>.<algo>` into body and algorithm.
fn split_ref(s: &str, sigil: char) -> Result<(&str, &str), ParseError> {
    let rest = s
        .strip_prefix(sigil)
        .ok_or_else(|| InvalidSigilSnafu { expected: sigil }.build())?;
    rest.rsplit_once('.')
        .ok_or_else(|| MissingAlgoSnafu.build())
}

macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// The public key of a peer.
///
/// This is both the identity a connection is authenticated as and the key a feed is signed
/// with. Construction checks that the bytes are a valid ed25519 point.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Creates a peer id from its 32 raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ParseError> {
        VerifyingKey::from_bytes(bytes).context(InvalidKeySnafu)?;
        Ok(Self(*bytes))
    }

    /// The raw bytes of the key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to a hex string limited to the first 5 bytes for a friendly string
    /// representation of the key.
    pub fn fmt_short(&self) -> String {
        HEXLOWER.encode(&self.0[..5])
    }
}

impl From<VerifyingKey> for PeerId {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(&self.0))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.fmt_short())
    }
}

impl FromStr for PeerId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(&decode_32(s)?)
    }
}

serde_via_str!(PeerId);

/// The signature format of a feed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
)]
pub enum FeedAlgo {
    /// Classic JSON feeds signed with ed25519.
    #[default]
    #[strum(serialize = "ed25519")]
    Ed25519,
    /// Gabby grove binary feeds.
    #[strum(serialize = "ggfeed-v1")]
    GabbyGrove,
}

/// A reference to a feed: an author key together with the feed format.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedRef {
    algo: FeedAlgo,
    id: PeerId,
}

impl FeedRef {
    /// Creates a feed reference.
    pub fn new(algo: FeedAlgo, id: PeerId) -> Self {
        Self { algo, id }
    }

    /// The classic ed25519 feed of `id`.
    pub fn ed25519(id: PeerId) -> Self {
        Self::new(FeedAlgo::Ed25519, id)
    }

    /// The feed format.
    pub fn algo(&self) -> FeedAlgo {
        self.algo
    }

    /// The author of the feed.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Short form of the author key, for logging.
    pub fn fmt_short(&self) -> String {
        self.id.fmt_short()
    }
}

impl Display for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", self.id, self.algo)
    }
}

impl Debug for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedRef(@{}.{})", self.id.fmt_short(), self.algo)
    }
}

impl FromStr for FeedRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, algo) = split_ref(s, '@')?;
        let algo = algo
            .parse()
            .map_err(|_| UnknownAlgoSnafu { algo }.build())?;
        let id = key.parse()?;
        Ok(Self { algo, id })
    }
}

serde_via_str!(FeedRef);

/// A sha256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Hashes `data`.
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(data.as_ref()).into())
    }

    /// Creates a hash from its raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 5 bytes as hex, for logging.
    pub fn fmt_short(&self) -> String {
        HEXLOWER.encode(&self.0[..5])
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(&self.0))
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.fmt_short())
    }
}

/// Parses `<sigil><base64>.sha256`.
fn parse_sha256(s: &str, sigil: char) -> Result<Hash, ParseError> {
    let (hash, algo) = split_ref(s, sigil)?;
    snafu::ensure!(algo == "sha256", UnknownAlgoSnafu { algo });
    Ok(Hash(decode_32(hash)?))
}

/// A reference to a blob.
///
/// The size is whatever the referencing message claimed and is not trusted. Equality and
/// hashing only look at the content hash.
#[derive(Clone, Copy)]
pub struct BlobRef {
    hash: Hash,
    size: Option<u64>,
}

impl BlobRef {
    /// A reference to the blob with the given hash, with unknown size.
    pub fn new(hash: Hash) -> Self {
        Self { hash, size: None }
    }

    /// A reference to `content`, with its actual size.
    pub fn of(content: impl AsRef<[u8]>) -> Self {
        let content = content.as_ref();
        Self::new(Hash::new(content)).with_size(content.len() as u64)
    }

    /// Sets the declared size.
    pub fn with_size(self, size: u64) -> Self {
        Self {
            size: Some(size),
            ..self
        }
    }

    /// The content hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The declared size, if any.
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

impl PartialEq for BlobRef {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for BlobRef {}

impl std::hash::Hash for BlobRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state)
    }
}

impl Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}.sha256", self.hash)
    }
}

impl Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            Some(size) => write!(f, "BlobRef({}, {size}b)", self.hash.fmt_short()),
            None => write!(f, "BlobRef({})", self.hash.fmt_short()),
        }
    }
}

impl FromStr for BlobRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_sha256(s, '&').map(Self::new)
    }
}

serde_via_str!(BlobRef);

/// The key of a message: the hash of its encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageRef(Hash);

impl MessageRef {
    /// Creates a message reference from the hash of the message.
    pub fn new(hash: Hash) -> Self {
        Self(hash)
    }

    /// The hash of the message.
    pub fn hash(&self) -> Hash {
        self.0
    }
}

impl Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}.sha256", self.0)
    }
}

impl Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageRef({})", self.0.fmt_short())
    }
}

impl FromStr for MessageRef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_sha256(s, '%').map(Self)
    }
}

serde_via_str!(MessageRef);

/// A sequence number in a feed.
///
/// Feeds start at 1; `Seq::ZERO` means nothing has been received yet.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
    /// Nothing received.
    pub const ZERO: Seq = Seq(0);
    /// The first entry of a feed.
    pub const FIRST: Seq = Seq(1);

    /// The sequence number following this one.
    pub fn next(self) -> Seq {
        Seq(self.0 + 1)
    }

    /// The raw number.
    pub fn get(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ed25519_dalek::SigningKey;

    use super::*;

    fn key(seed: u8) -> PeerId {
        SigningKey::from_bytes(&[seed; 32]).verifying_key().into()
    }

    #[test]
    fn feed_ref_string_form() {
        let feed = FeedRef::ed25519(key(1));
        let s = feed.to_string();
        assert!(s.starts_with('@'));
        assert!(s.ends_with(".ed25519"));
        assert_eq!(s.parse::<FeedRef>().unwrap(), feed);

        let json = serde_json::to_string(&feed).unwrap();
        assert_eq!(json, format!("\"{s}\""));
    }

    #[test]
    fn feed_ref_rejects_garbage() {
        assert!(matches!(
            "%abc.ed25519".parse::<FeedRef>(),
            Err(ParseError::InvalidSigil { expected: '@', .. })
        ));
        let key = key(2).to_string();
        assert!(matches!(
            format!("@{key}.rsa").parse::<FeedRef>(),
            Err(ParseError::UnknownAlgo { .. })
        ));
        assert!(matches!(
            "@AAAA.ed25519".parse::<FeedRef>(),
            Err(ParseError::InvalidLength { len: 3, .. })
        ));
        assert!(matches!(
            "@not base64!.ed25519".parse::<FeedRef>(),
            Err(ParseError::InvalidEncoding { .. })
        ));
    }

    #[test]
    fn gabby_grove_feeds() {
        let feed = FeedRef::new(FeedAlgo::GabbyGrove, key(3));
        assert!(feed.to_string().ends_with(".ggfeed-v1"));
        assert_eq!(feed.to_string().parse::<FeedRef>().unwrap().algo(), FeedAlgo::GabbyGrove);
    }

    #[test]
    fn blob_identity_ignores_size() {
        let blob = BlobRef::of(b"hello world");
        assert_eq!(blob.size(), Some(11));
        let claimed = blob.with_size(1 << 30);
        assert_eq!(blob, claimed);

        let mut set = HashSet::new();
        set.insert(blob);
        assert!(!set.insert(claimed));

        let parsed: BlobRef = blob.to_string().parse().unwrap();
        assert_eq!(parsed, blob);
        assert_eq!(parsed.size(), None);
    }

    #[test]
    fn message_and_blob_sigils_differ() {
        let hash = Hash::new(b"x");
        let blob = BlobRef::new(hash).to_string();
        let msg = MessageRef::new(hash).to_string();
        assert!(blob.parse::<MessageRef>().is_err());
        assert!(msg.parse::<BlobRef>().is_err());
        assert_eq!(msg.parse::<MessageRef>().unwrap().hash(), hash);
    }

    #[test]
    fn seq_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Seq::FIRST).unwrap(), "1");
        assert_eq!(Seq::ZERO.next(), Seq::FIRST);
    }
}
