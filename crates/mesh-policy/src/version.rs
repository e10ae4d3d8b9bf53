//! Version strings and OSGi-style version ranges.
//!
//! A range looks like `[1.2.3,4.5.6)` where `[`/`]` are inclusive bounds and `(`/`)` exclusive
//! ones. A bare version `v` is shorthand for `[v,INFINITY)`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use log::debug;
use thiserror::Error;

/// Literal used for an unbounded end of a range
pub const INFINITY: &str = "INFINITY";

const LEFT_INCLUSIVE: char = '[';
const LEFT_EXCLUSIVE: char = '(';
const RIGHT_INCLUSIVE: char = ']';
const RIGHT_EXCLUSIVE: char = ')';
const VERSION_SEPARATOR: char = ',';
const SEGMENT_SEPARATOR: char = '.';

/// Errors raised while parsing or combining versions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Empty string is not a valid version")]
    Empty,

    #[error("Whitespace is not permitted in {0}")]
    Whitespace(String),

    #[error("{0} is not a valid version string")]
    InvalidVersion(String),

    #[error("{0} does not begin with an inclusion or exclusion directive")]
    MissingOpenBound(String),

    #[error("{0} does not end with an inclusion or exclusion directive")]
    MissingCloseBound(String),

    #[error("Incorrect number of versions in expression: {0}")]
    WrongVersionCount(String),

    #[error("No intersection found between {0} and {1}")]
    NoIntersection(String, String),

    #[error("Invalid ceiling version: {0}")]
    InvalidCeiling(String),
}

/// A single normalized version, either `major.minor.patch` or unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// Three numeric segments, missing segments are zero
    Finite([u64; 3]),

    /// The `INFINITY` literal, greater than every finite version
    Infinity,
}

impl Version {
    /// The lowest possible version, `0.0.0`
    pub const ZERO: Version = Version::Finite([0, 0, 0]);

    pub fn is_infinite(&self) -> bool {
        matches!(self, Version::Infinity)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Version::Infinity, Version::Infinity) => Ordering::Equal,
            (Version::Infinity, Version::Finite(_)) => Ordering::Greater,
            (Version::Finite(_), Version::Infinity) => Ordering::Less,
            // Most significant segment first, stops at the first difference
            (Version::Finite(a), Version::Finite(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionError::Empty);
        }
        if s == INFINITY {
            return Ok(Version::Infinity);
        }
        if !is_version_string(s) {
            return Err(VersionError::InvalidVersion(s.to_string()));
        }

        let mut segments = [0u64; 3];
        for (i, segment) in s.split(SEGMENT_SEPARATOR).enumerate() {
            segments[i] = segment
                .parse()
                .map_err(|_| VersionError::InvalidVersion(s.to_string()))?;
        }
        Ok(Version::Finite(segments))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Finite([major, minor, patch]) => write!(f, "{}.{}.{}", major, minor, patch),
            Version::Infinity => write!(f, "{}", INFINITY),
        }
    }
}

/// Returns true if `expr` is `INFINITY` or a dotted numeric version of 1 to 3 segments.
///
/// Empty segments, non-digit characters and leading zeros (`1.02`) are rejected.
pub fn is_version_string(expr: &str) -> bool {
    if expr.is_empty() {
        return false;
    }
    if expr == INFINITY {
        return true;
    }

    let segments: Vec<&str> = expr.split(SEGMENT_SEPARATOR).collect();
    if segments.len() > 3 {
        return false;
    }

    segments.iter().all(|segment| {
        !segment.is_empty()
            && segment.chars().all(|c| c.is_ascii_digit())
            && !(segment.len() > 1 && segment.starts_with('0'))
    })
}

/// Returns true if `expr` looks like a full bracketed range of two versions
pub fn is_version_expression(expr: &str) -> bool {
    if expr.len() < 2 {
        return false;
    }
    let opens = expr.starts_with(LEFT_INCLUSIVE) || expr.starts_with(LEFT_EXCLUSIVE);
    let closes = expr.ends_with(RIGHT_INCLUSIVE) || expr.ends_with(RIGHT_EXCLUSIVE);
    if !opens || !closes {
        return false;
    }

    let body = &expr[1..expr.len() - 1];
    let versions: Vec<&str> = body.split(VERSION_SEPARATOR).collect();
    versions.len() == 2 && versions.iter().all(|v| is_version_string(v))
}

/// Compare two version strings segment by segment
pub fn compare_versions(v1: &str, v2: &str) -> Result<Ordering, VersionError> {
    let a: Version = v1.parse()?;
    let b: Version = v2.parse()?;
    Ok(a.cmp(&b))
}

/// Pick the greatest candidate that falls inside `range`.
///
/// With no range, `[0.0.0,INFINITY)` is used. Returns `Ok(None)` when no candidate fits.
pub fn get_highest_version<'a, I>(
    candidates: I,
    range: Option<&VersionExpression>,
) -> Result<Option<&'a str>, VersionError>
where
    I: IntoIterator<Item = &'a str>,
{
    let default_range = VersionExpression::all_versions();
    let range = range.unwrap_or(&default_range);

    let mut best: Option<(Version, &'a str)> = None;
    for candidate in candidates {
        let version: Version = candidate.parse()?;
        if !range.contains(&version) {
            continue;
        }
        match best {
            Some((current, _)) if current >= version => {}
            _ => best = Some((version, candidate)),
        }
    }

    Ok(best.map(|(_, s)| s))
}

/// A range of versions with inclusive or exclusive bounds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionExpression {
    /// Lower bound
    start: Version,

    /// Whether the lower bound itself is in range
    start_inclusive: bool,

    /// Upper bound, possibly `INFINITY`
    end: Version,

    /// Whether the upper bound itself is in range
    end_inclusive: bool,
}

impl VersionExpression {
    /// Parse a range expression or a single version
    pub fn parse(expr: &str) -> Result<Self, VersionError> {
        if expr.is_empty() {
            return Err(VersionError::Empty);
        }
        if expr.chars().any(char::is_whitespace) {
            return Err(VersionError::Whitespace(expr.to_string()));
        }

        let owned;
        let full = if is_single_version(expr) {
            if !is_version_string(expr) {
                return Err(VersionError::InvalidVersion(expr.to_string()));
            }
            owned = format!("{}{}{}{}{}", LEFT_INCLUSIVE, expr, VERSION_SEPARATOR, INFINITY, RIGHT_EXCLUSIVE);
            debug!("Detected single version {}, converted to {}", expr, owned);
            owned.as_str()
        } else {
            expr
        };

        let start_inclusive = match full.chars().next() {
            Some(LEFT_INCLUSIVE) => true,
            Some(LEFT_EXCLUSIVE) => false,
            _ => return Err(VersionError::MissingOpenBound(expr.to_string())),
        };
        let end_inclusive = match full.chars().last() {
            Some(RIGHT_INCLUSIVE) if full.len() > 1 => true,
            Some(RIGHT_EXCLUSIVE) if full.len() > 1 => false,
            _ => return Err(VersionError::MissingCloseBound(expr.to_string())),
        };

        let body = &full[1..full.len() - 1];
        let versions: Vec<&str> = body.split(VERSION_SEPARATOR).collect();
        if versions.len() != 2 || versions[0].is_empty() || versions[1].is_empty() {
            return Err(VersionError::WrongVersionCount(full.to_string()));
        }

        let start: Version = versions[0].parse()?;
        let end: Version = versions[1].parse()?;

        Ok(Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
        })
    }

    /// The range `[0.0.0,INFINITY)`
    pub fn all_versions() -> Self {
        Self {
            start: Version::ZERO,
            start_inclusive: true,
            end: Version::Infinity,
            end_inclusive: false,
        }
    }

    pub fn start(&self) -> Version {
        self.start
    }

    pub fn end(&self) -> Version {
        self.end
    }

    /// Returns true if `version` is a valid version string within this range
    pub fn is_within_range(&self, version: &str) -> Result<bool, VersionError> {
        let version: Version = version.parse()?;
        Ok(self.contains(&version))
    }

    /// Range membership for an already parsed version
    pub fn contains(&self, version: &Version) -> bool {
        if (*version == self.start && self.start_inclusive) || (*version == self.end && self.end_inclusive) {
            return true;
        }
        if *version == self.start || *version == self.end {
            return false;
        }
        if self.start > *version {
            return false;
        }
        if self.end.is_infinite() {
            return true;
        }
        self.end > *version
    }

    /// Whether every version in `other` is also in this range
    pub fn contains_range(&self, other: &VersionExpression) -> bool {
        let lower = match other.start.cmp(&self.start) {
            Ordering::Greater => true,
            Ordering::Equal => self.start_inclusive || !other.start_inclusive,
            Ordering::Less => false,
        };
        let upper = match other.end.cmp(&self.end) {
            Ordering::Less => true,
            Ordering::Equal => self.end_inclusive || !other.end_inclusive,
            Ordering::Greater => false,
        };
        lower && upper
    }

    /// Narrow this range to its intersection with `other`
    pub fn intersects_with(&mut self, other: &VersionExpression) -> Result<(), VersionError> {
        let original = self.to_string();

        match self.start.cmp(&other.start) {
            Ordering::Equal => self.start_inclusive = self.start_inclusive && other.start_inclusive,
            Ordering::Less => {
                self.start = other.start;
                self.start_inclusive = other.start_inclusive;
            }
            Ordering::Greater => {}
        }

        match self.end.cmp(&other.end) {
            Ordering::Equal => self.end_inclusive = self.end_inclusive && other.end_inclusive,
            Ordering::Greater => {
                self.end = other.end;
                self.end_inclusive = other.end_inclusive;
            }
            Ordering::Less => {}
        }

        let empty = match self.start.cmp(&self.end) {
            Ordering::Greater => true,
            Ordering::Equal => !(self.start_inclusive && self.end_inclusive),
            Ordering::Less => false,
        };
        if empty {
            return Err(VersionError::NoIntersection(original, other.to_string()));
        }
        Ok(())
    }

    /// Replace the upper bound. An `INFINITY` ceiling is always exclusive.
    pub fn change_ceiling(&mut self, ceiling: &str, inclusive: bool) -> Result<(), VersionError> {
        let ceiling: Version = ceiling.parse()?;
        if ceiling.is_infinite() {
            self.end = Version::Infinity;
            self.end_inclusive = false;
            return Ok(());
        }

        match ceiling.cmp(&self.start) {
            Ordering::Less => {
                return Err(VersionError::InvalidCeiling(format!(
                    "{} is lower than the start version {}",
                    ceiling, self.start
                )));
            }
            Ordering::Equal if !(inclusive && self.start_inclusive) => {
                return Err(VersionError::InvalidCeiling(format!(
                    "{} equals the start version but a bound is exclusive",
                    ceiling
                )));
            }
            _ => {}
        }

        self.end = ceiling;
        self.end_inclusive = inclusive;
        Ok(())
    }
}

impl FromStr for VersionExpression {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionExpression::parse(s)
    }
}

impl fmt::Display for VersionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.start_inclusive { LEFT_INCLUSIVE } else { LEFT_EXCLUSIVE };
        let close = if self.end_inclusive { RIGHT_INCLUSIVE } else { RIGHT_EXCLUSIVE };
        write!(f, "{}{}{}{}{}", open, self.start, VERSION_SEPARATOR, self.end, close)
    }
}

fn is_single_version(expr: &str) -> bool {
    let first = expr.chars().next();
    let last = expr.chars().last();
    !matches!(first, Some(LEFT_INCLUSIVE) | Some(LEFT_EXCLUSIVE))
        && !expr.contains(VERSION_SEPARATOR)
        && !matches!(last, Some(RIGHT_INCLUSIVE) | Some(RIGHT_EXCLUSIVE))
}
