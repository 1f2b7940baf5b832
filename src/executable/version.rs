use crate::error::{Error, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static DECLARED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(\d+)\.(\d+)(?:\.(\d+))?([-+.A-Za-z0-9]*)$").expect("valid regex")
});

static REPORTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"v?((\d+)\.(\d+)\.(\d+))([^, \s]*)").expect("valid regex"));

/// A MongoDB version such as `2.0.1` or `2.1.0-rc1`.
///
/// Versions compare by major, minor and patch, then by suffix: a version
/// with a pre-release suffix sorts before the same version without one.
/// The original text is kept for display only.
///
/// ```
/// use mongo_runner::executable::MongoVersion;
///
/// let rc: MongoVersion = "2.1.0-rc1".parse().unwrap();
/// let release: MongoVersion = "2.1.0".parse().unwrap();
/// assert!(rc < release);
/// assert!(rc.is_prerelease());
/// assert!(!release.is_stable());
/// ```
#[derive(Debug, Clone)]
pub struct MongoVersion {
    major: u32,
    minor: u32,
    patch: u32,
    suffix: String,
    text: String,
}

impl MongoVersion {
    fn from_parts(major: &str, minor: &str, patch: Option<&str>, suffix: &str, text: &str) -> Result<Self> {
        let number = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| Error::Configuration(format!("Invalid version number '{}'", text)))
        };
        Ok(Self {
            major: number(major)?,
            minor: number(minor)?,
            patch: patch.map(number).transpose()?.unwrap_or(0),
            suffix: normalize_suffix(suffix),
            text: text.to_string(),
        })
    }

    /// Extracts the version from `mongod --version` style output.
    ///
    /// Returns `None` when the output holds no recognizable version.
    pub fn from_version_output(output: &str) -> Option<Self> {
        let caps = REPORTED.captures(output)?;
        let text = format!("{}{}", &caps[1], &caps[5]);
        Self::from_parts(&caps[2], &caps[3], Some(&caps[4]), &caps[5], &text).ok()
    }

    /// Major version number.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Minor version number.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Patch version number, zero when absent.
    pub fn patch(&self) -> u32 {
        self.patch
    }

    /// Normalized pre-release suffix, empty for releases.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Whether this is a pre-release build.
    pub fn is_prerelease(&self) -> bool {
        !self.suffix.is_empty()
    }

    /// Whether this belongs to a stable release series (even minor number).
    pub fn is_stable(&self) -> bool {
        self.minor % 2 == 0
    }

    fn key(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

fn normalize_suffix(suffix: &str) -> String {
    let suffix = suffix.replace("-pre-", "-pre");
    suffix.trim_start_matches(['-', '.']).to_string()
}

impl FromStr for MongoVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let caps = DECLARED
            .captures(trimmed)
            .ok_or_else(|| Error::Configuration(format!("Invalid version '{}'", s)))?;
        Self::from_parts(
            &caps[1],
            &caps[2],
            caps.get(3).map(|m| m.as_str()),
            &caps[4],
            trimmed,
        )
    }
}

impl PartialEq for MongoVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MongoVersion {}

impl PartialOrd for MongoVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MongoVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key()).then_with(|| {
            match (self.suffix.is_empty(), other.suffix.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.suffix.cmp(&other.suffix),
            }
        })
    }
}

impl fmt::Display for MongoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
