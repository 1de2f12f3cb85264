//! Version and constraint model.
//!
//! Package versions follow the PEP 440 release grammar (release segments with
//! optional pre, post and dev parts). Constraints accept the Poetry spellings
//! (`^1.2`, `~1.2`, `*`, `1.2.*`) as well as PEP 440 comparators (`>=1.0,<2.0`,
//! `~=1.4`, `!=1.3`) and `||` alternatives.

use crate::errors::VersionError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^v?
        (?P<release>\d+(?:\.\d+)*)
        (?:[-_.]?(?P<pre_l>alpha|beta|rc|a|b|c|preview|pre)[-_.]?(?P<pre_n>\d+)?)?
        (?P<post>-(?P<post_n1>\d+)|[-_.]?(?:post|rev|r)[-_.]?(?P<post_n2>\d+)?)?
        (?P<dev>[-_.]?dev[-_.]?(?P<dev_n>\d+)?)?
        $",
    )
    .expect("version regex is valid")
});

static RUNTIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+(?:\.\d+)?$").expect("runtime regex is valid"));

static COMPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<op>===|==|!=|~=|>=|<=|>|<|\^|~|=)?\s*(?P<ver>[0-9A-Za-z.*_-]+)")
        .expect("comparator regex is valid")
});

/// Pre-release phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreRelease {
    /// `a`, `alpha`
    Alpha,
    /// `b`, `beta`
    Beta,
    /// `rc`, `c`, `pre`, `preview`
    Rc,
}

impl PreRelease {
    fn tag(self) -> &'static str {
        match self {
            Self::Alpha => "a",
            Self::Beta => "b",
            Self::Rc => "rc",
        }
    }
}

/// A package version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    release: Vec<u64>,
    pre: Option<(PreRelease, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
}

type SortKey = (Vec<u64>, (i8, u8, u64), (i8, u64), (i8, u64));

impl Version {
    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty or not a valid version.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        let malformed = || VersionError::Malformed(trimmed.to_string());
        let caps = VERSION_RE.captures(trimmed).ok_or_else(malformed)?;

        let release = caps["release"]
            .split('.')
            .map(|part| part.parse::<u64>().map_err(|_| malformed()))
            .collect::<Result<Vec<_>, _>>()?;

        let number = |name: &str| -> Result<Option<u64>, VersionError> {
            caps.name(name)
                .map(|m| m.as_str().parse::<u64>().map_err(|_| malformed()))
                .transpose()
        };

        let pre = match caps.name("pre_l") {
            Some(label) => {
                let phase = match label.as_str().to_ascii_lowercase().as_str() {
                    "a" | "alpha" => PreRelease::Alpha,
                    "b" | "beta" => PreRelease::Beta,
                    _ => PreRelease::Rc,
                };
                Some((phase, number("pre_n")?.unwrap_or(0)))
            }
            None => None,
        };
        let post = if caps.name("post").is_some() {
            Some(number("post_n1")?.or(number("post_n2")?).unwrap_or(0))
        } else {
            None
        };
        let dev = if caps.name("dev").is_some() {
            Some(number("dev_n")?.unwrap_or(0))
        } else {
            None
        };

        Ok(Self {
            release,
            pre,
            post,
            dev,
        })
    }

    /// Creates a final release from its segments.
    #[must_use]
    pub fn from_release(release: Vec<u64>) -> Self {
        Self {
            release,
            pre: None,
            post: None,
            dev: None,
        }
    }

    /// Release segments (e.g. `[1, 2, 0]`).
    #[must_use]
    pub fn release(&self) -> &[u64] {
        &self.release
    }

    /// Returns true for pre-releases and development releases.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    /// Final release that bumps segment `index` and drops everything after it.
    fn bumped(&self, index: usize) -> Self {
        let mut release: Vec<u64> = self.release.iter().take(index + 1).copied().collect();
        release.resize(index + 1, 0);
        release[index] += 1;
        Self::from_release(release)
    }

    fn sort_key(&self) -> SortKey {
        let mut release = self.release.clone();
        while release.len() > 1 && release.last() == Some(&0) {
            release.pop();
        }
        let pre = match (self.pre, self.post, self.dev) {
            (None, None, Some(_)) => (-1, 0, 0),
            (Some((phase, n)), _, _) => (0, phase as u8, n),
            (None, _, _) => (1, 0, 0),
        };
        let post = self.post.map_or((-1, 0), |n| (0, n));
        let dev = self.dev.map_or((1, 0), |n| (0, n));
        (release, pre, post, dev)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let release: Vec<String> = self.release.iter().map(ToString::to_string).collect();
        write!(f, "{}", release.join("."))?;
        if let Some((phase, n)) = self.pre {
            write!(f, "{}{n}", phase.tag())?;
        }
        if let Some(n) = self.post {
            write!(f, ".post{n}")?;
        }
        if let Some(n) = self.dev {
            write!(f, ".dev{n}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

/// A requested interpreter version such as `3.11`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuntimeVersion(String);

impl RuntimeVersion {
    /// Parses `MAJOR.MINOR[.PATCH]`.
    ///
    /// # Errors
    ///
    /// Returns an error for anything else.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        if !RUNTIME_RE.is_match(trimmed) {
            return Err(VersionError::Malformed(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The version as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The version as a comparable [`Version`].
    #[must_use]
    pub fn to_version(&self) -> Version {
        Version::from_release(self.0.split('.').filter_map(|p| p.parse().ok()).collect())
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RuntimeVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RuntimeVersion> for String {
    fn from(value: RuntimeVersion) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Comparator {
    Any,
    Exact(Version),
    Prefix(Vec<u64>),
    NotExact(Version),
    NotPrefix(Vec<u64>),
    Greater(Version),
    GreaterEq(Version),
    Less(Version),
    LessEq(Version),
}

impl Comparator {
    fn matches(&self, version: &Version) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => version == v,
            Self::Prefix(p) => has_prefix(version, p),
            Self::NotExact(v) => version != v,
            Self::NotPrefix(p) => !has_prefix(version, p),
            Self::Greater(v) => version > v,
            Self::GreaterEq(v) => version >= v,
            Self::Less(v) => version < v,
            Self::LessEq(v) => version <= v,
        }
    }

    fn mentions_prerelease(&self) -> bool {
        match self {
            Self::Exact(v)
            | Self::NotExact(v)
            | Self::Greater(v)
            | Self::GreaterEq(v)
            | Self::Less(v)
            | Self::LessEq(v) => v.is_prerelease(),
            _ => false,
        }
    }
}

fn has_prefix(version: &Version, prefix: &[u64]) -> bool {
    let release = version.release();
    prefix
        .iter()
        .enumerate()
        .all(|(i, p)| release.get(i).copied().unwrap_or(0) == *p)
}

/// A version constraint: alternatives of comparator conjunctions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Constraint {
    raw: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl Constraint {
    /// A constraint accepting every version.
    #[must_use]
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            alternatives: vec![vec![Comparator::Any]],
        }
    }

    /// Parses a constraint expression.
    ///
    /// # Errors
    ///
    /// Returns an error if any comparator is malformed.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let raw = input.trim();
        if raw.is_empty() || raw == "*" {
            return Ok(Self::any());
        }
        let invalid = || VersionError::Constraint(raw.to_string());

        let mut alternatives = Vec::new();
        for group in raw.split("||").flat_map(|g| g.split('|')) {
            let normalized = group.replace(',', " ");
            let mut comparators = Vec::new();
            let mut last = 0;
            for caps in COMPARATOR_RE.captures_iter(&normalized) {
                let whole = caps.get(0).ok_or_else(invalid)?;
                if !normalized[last..whole.start()].trim().is_empty() {
                    return Err(invalid());
                }
                last = whole.end();
                let op = caps.name("op").map(|m| m.as_str());
                comparators.extend(parse_comparator(op, &caps["ver"]).map_err(|_| invalid())?);
            }
            if comparators.is_empty() || !normalized[last..].trim().is_empty() {
                return Err(invalid());
            }
            alternatives.push(comparators);
        }

        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    /// Returns true if `version` satisfies the constraint.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|group| group.iter().all(|c| c.matches(version)))
    }

    /// Returns true if the constraint accepts every version.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.alternatives
            .iter()
            .any(|group| group.iter().all(|c| *c == Comparator::Any))
    }

    /// Returns true if a bound itself is a pre-release.
    #[must_use]
    pub fn mentions_prerelease(&self) -> bool {
        self.alternatives
            .iter()
            .flatten()
            .any(Comparator::mentions_prerelease)
    }

    /// The expression as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_comparator(op: Option<&str>, ver: &str) -> Result<Vec<Comparator>, VersionError> {
    let op = op.unwrap_or("");
    if ver == "*" {
        return match op {
            "" | "=" | "==" => Ok(vec![Comparator::Any]),
            _ => Err(VersionError::Constraint(format!("{op}{ver}"))),
        };
    }
    if let Some(prefix) = ver.strip_suffix(".*") {
        let segments = prefix
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VersionError::Constraint(format!("{op}{ver}")))?;
        return match op {
            "" | "=" | "==" => Ok(vec![Comparator::Prefix(segments)]),
            "!=" => Ok(vec![Comparator::NotPrefix(segments)]),
            _ => Err(VersionError::Constraint(format!("{op}{ver}"))),
        };
    }

    let version = Version::parse(ver)?;
    let comparators = match op {
        "" | "=" | "==" | "===" => vec![Comparator::Exact(version)],
        "!=" => vec![Comparator::NotExact(version)],
        ">" => vec![Comparator::Greater(version)],
        ">=" => vec![Comparator::GreaterEq(version)],
        "<" => vec![Comparator::Less(version)],
        "<=" => vec![Comparator::LessEq(version)],
        "^" => {
            let release = version.release();
            let index = release
                .iter()
                .position(|s| *s != 0)
                .unwrap_or(release.len().saturating_sub(1));
            let upper = version.bumped(index);
            vec![Comparator::GreaterEq(version), Comparator::Less(upper)]
        }
        "~" => {
            let index = usize::from(version.release().len() > 1);
            let upper = version.bumped(index);
            vec![Comparator::GreaterEq(version), Comparator::Less(upper)]
        }
        "~=" => {
            let len = version.release().len();
            if len < 2 {
                return Err(VersionError::Constraint(format!("~={ver}")));
            }
            let upper = version.bumped(len - 2);
            vec![Comparator::GreaterEq(version), Comparator::Less(upper)]
        }
        other => return Err(VersionError::Constraint(format!("{other}{ver}"))),
    };
    Ok(comparators)
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Constraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Constraint {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Constraint> for String {
    fn from(value: Constraint) -> Self {
        value.raw
    }
}
