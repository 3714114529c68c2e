use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Delimiter joining show and episode title into a single lookup key.
///
/// U+001F (unit separator) cannot appear in natural text, so the join is
/// unambiguous and two distinct episodes never collide.
const DELIMITER: char = '\u{1F}';

/// Longest encoded stem kept verbatim. Stems past this are truncated and
/// disambiguated with a digest suffix so derived filenames (plus their
/// `.json.partial` siblings) stay well within the OS's 255-byte limit.
const MAX_STEM_LENGTH: usize = 100;

/// Stable composite key identifying one episode of one show.
///
/// Used as the sole lookup key across the record store, the file store and
/// the in-memory cache. Titles are trimmed on construction; case is
/// preserved, so `"Serial"` and `"serial"` are distinct shows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EpisodeIdentity {
    show_title: String,
    episode_title: String,
}

impl EpisodeIdentity {
    pub fn new(show_title: &str, episode_title: &str) -> Self {
        Self {
            show_title: show_title.trim().to_string(),
            episode_title: episode_title.trim().to_string(),
        }
    }

    pub fn show_title(&self) -> &str {
        &self.show_title
    }

    pub fn episode_title(&self) -> &str {
        &self.episode_title
    }

    /// The joined key used by the stores
    pub fn key(&self) -> String {
        format!("{}{}{}", self.show_title, DELIMITER, self.episode_title)
    }

    /// Parse a stored key back into an identity.
    ///
    /// Keys without the delimiter are treated as an episode title under an
    /// empty show title rather than rejected; old stores may contain them.
    pub fn from_key(key: &str) -> Self {
        match key.split_once(DELIMITER) {
            Some((show, episode)) => Self::new(show, episode),
            None => Self::new("", key),
        }
    }

    /// Filesystem-safe form of the key for naming record and media files.
    ///
    /// Every unsafe character, including the escape character itself,
    /// becomes `_<hex>_`, so two distinct identities never share a stem.
    /// Long keys are truncated to [`MAX_STEM_LENGTH`] with a digest of the
    /// full key appended, keeping the stem both bounded and distinct.
    pub fn file_stem(&self) -> String {
        let key = self.key();
        let mut stem = String::new();
        for c in key.chars() {
            if c.is_ascii_alphanumeric() || c == '-' {
                stem.push(c);
            } else {
                stem.push('_');
                stem.push_str(&format!("{:x}", c as u32));
                stem.push('_');
            }
        }

        if stem.len() > MAX_STEM_LENGTH {
            // The encoded stem is pure ASCII, so this cut is always on a
            // character boundary
            stem.truncate(MAX_STEM_LENGTH);
            stem.push('-');
            for byte in &Sha256::digest(key.as_bytes())[..8] {
                stem.push_str(&format!("{byte:02x}"));
            }
        }
        stem
    }
}

impl fmt::Display for EpisodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.show_title, self.episode_title)
    }
}

impl Serialize for EpisodeIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for EpisodeIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Ok(EpisodeIdentity::from_key(&key))
    }
}
