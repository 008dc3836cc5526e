// Validated Types
// Strongly-typed wrappers that enforce invariants at construction time, so the rest
// of the crate never has to re-check them.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// A registry-unique database name.
///
/// # Invariants
/// - Matches `[a-z0-9_-]+`
/// - 1..=64 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        crate::validation::registry::validate_database_name(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DatabaseName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A path that has been validated and is guaranteed to be safe to use as a
/// `DatabaseEntry.path` or `source_folder`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedPath {
    inner: PathBuf,
}

impl ValidatedPath {
    /// # Invariants
    /// - Non-empty, valid UTF-8, no null bytes, no `..` traversal components
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Path is not valid UTF-8"))?;

        crate::validation::path::validate_file_path(path_str)?;

        Ok(Self {
            inner: path.to_path_buf(),
        })
    }

    pub fn as_path(&self) -> &Path {
        &self.inner
    }

    pub fn as_str(&self) -> &str {
        self.inner.to_str().expect("ValidatedPath is always UTF-8")
    }
}

impl fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A 256-bit content fingerprint over normalized file bytes.
///
/// Two files with identical content share one fingerprint; this is the
/// single-flight key for the Processed-Files Ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the fingerprint of normalized file content (SHA-256 over the raw bytes).
    pub fn of_content(content: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(content);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded = hex::decode(s)?;
        ensure!(decoded.len() == 32, "fingerprint must be 32 bytes");
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A reference to a secret (env-var name or secret-store id), never the secret
/// itself. `Debug`/`Display` always render the masked form; the only way to get
/// the real value is `reveal()`, used at the single point a connection string is
/// assembled.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretRef(String);

const MASK: &str = "<masked>";

impl SecretRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Resolve the reference to its real value (env-var lookup or, for a bare
    /// literal used in tests, the literal itself).
    pub fn reveal(&self) -> Option<String> {
        std::env::var(&self.0).ok().or_else(|| Some(self.0.clone()))
    }

    pub fn reference(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretRef({MASK})")
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{MASK}")
    }
}

impl PartialEq for SecretRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// A non-zero byte size (file sizes, ledger entry sizes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NonZeroSize(u64);

impl NonZeroSize {
    pub fn new(size: u64) -> Result<Self> {
        ensure!(size > 0, "Size must be greater than zero");
        Ok(Self(size))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// A timestamp with basic sanity bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidatedTimestamp(i64);

impl ValidatedTimestamp {
    pub fn new(timestamp: i64) -> Result<Self> {
        ensure!(timestamp > 0, "Timestamp must be positive");
        const YEAR_3000: i64 = 32_503_680_000;
        ensure!(timestamp < YEAR_3000, "Timestamp too far in future");
        Ok(Self(timestamp))
    }

    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_secs() as i64;
        Self(secs)
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }
}

/// The watcher's poll cadence. Invariant: `>= 10` seconds (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchInterval(u64);

impl WatchInterval {
    pub fn new(seconds: u64) -> Result<Self> {
        ensure!(seconds >= 10, "watch_interval_seconds must be >= 10");
        Ok(Self(seconds))
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

/// The result of clamping a requested `top_k` to a tier's server-side cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopK {
    requested: usize,
    effective: usize,
}

impl TopK {
    /// Clamp `requested` (or the tier default if `None`) to `cap`.
    pub fn clamp(requested: Option<usize>, default: usize, cap: usize) -> Self {
        let requested = requested.unwrap_or(default);
        Self {
            requested,
            effective: requested.min(cap),
        }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn effective(&self) -> usize {
        self.effective
    }

    pub fn was_clamped(&self) -> bool {
        self.requested != self.effective
    }
}

/// A query/tool-call tier, carrying its own resource policy (`spec.md` §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    T1,
    T2,
    T3,
    T4,
}

impl Tier {
    pub fn default_top_k(&self) -> Option<usize> {
        match self {
            Tier::T1 => None,
            Tier::T2 => Some(5),
            Tier::T3 => Some(10),
            Tier::T4 => None,
        }
    }

    pub fn top_k_cap(&self) -> Option<usize> {
        match self {
            Tier::T1 => None,
            Tier::T2 => Some(10),
            Tier::T3 => Some(15),
            Tier::T4 => None,
        }
    }

    pub fn soft_timeout(&self) -> std::time::Duration {
        use std::time::Duration;
        match self {
            Tier::T1 => Duration::from_secs(5),
            Tier::T2 => Duration::from_secs(30),
            Tier::T3 => Duration::from_secs(180),
            Tier::T4 => Duration::from_secs(900),
        }
    }

    /// `None` means unlimited (T1).
    pub fn concurrency_cap_per_db(&self) -> Option<usize> {
        match self {
            Tier::T1 => None,
            Tier::T2 => Some(8),
            Tier::T3 => Some(4),
            Tier::T4 => Some(2),
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Tier::T3 | Tier::T4)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::T1 => "T1",
            Tier::T2 => "T2",
            Tier::T3 => "T3",
            Tier::T4 => "T4",
        };
        write!(f, "{s}")
    }
}

/// The hint computed by the Classifier/Preprocessor that drives the Ingestion
/// Pipeline's tiered insert (`spec.md` §4.4, §4.5). Unrelated to `Tier`, which
/// classifies query/tool calls rather than ingestion items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestTier {
    Fast,
    Enriched,
}

impl fmt::Display for IngestTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestTier::Fast => "fast",
            IngestTier::Enriched => "enriched",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_name() {
        assert!(DatabaseName::new("proj1").is_ok());
        assert!(DatabaseName::new("proj-1_a").is_ok());
        assert!(DatabaseName::new("").is_err());
        assert!(DatabaseName::new("Proj1").is_err());
        assert!(DatabaseName::new("proj 1").is_err());
    }

    #[test]
    fn test_validated_path() {
        assert!(ValidatedPath::new("test/file.md").is_ok());
        assert!(ValidatedPath::new("").is_err());
        assert!(ValidatedPath::new("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_fingerprint_identity() {
        let a = Fingerprint::of_content(b"alpha beta");
        let b = Fingerprint::of_content(b"alpha beta");
        let c = Fingerprint::of_content(b"alpha betaa");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(Fingerprint::from_hex(&a.to_hex()).unwrap(), a);
    }

    #[test]
    fn test_secret_ref_never_displays_raw_value() {
        let secret = SecretRef::new("hunter2");
        assert_eq!(format!("{secret}"), MASK);
        assert_eq!(format!("{secret:?}"), "SecretRef(<masked>)");
    }

    #[test]
    fn test_watch_interval_minimum() {
        assert!(WatchInterval::new(10).is_ok());
        assert!(WatchInterval::new(9).is_err());
    }

    #[test]
    fn test_top_k_clamp() {
        let k = TopK::clamp(Some(25), 10, 15);
        assert_eq!(k.requested(), 25);
        assert_eq!(k.effective(), 15);
        assert!(k.was_clamped());

        let k = TopK::clamp(None, 10, 15);
        assert_eq!(k.requested(), 10);
        assert!(!k.was_clamped());
    }

    #[test]
    fn test_tier_policy_table() {
        assert_eq!(Tier::T1.concurrency_cap_per_db(), None);
        assert_eq!(Tier::T2.concurrency_cap_per_db(), Some(8));
        assert!(Tier::T3.is_background());
        assert!(!Tier::T2.is_background());
    }
}
