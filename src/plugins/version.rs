//! Semantic versions and version constraints.
//!
//! Versions follow `major.minor.patch[-pre][+build]` with an optional leading
//! `v`. Missing numeric components default to zero, so `"1.2"` parses as
//! `1.2.0`. Build metadata is carried but ignored for ordering and equality.
//!
//! Constraints use the operators `*`, `==`/`=`, `>`, `>=`, `<`, `<=`, `^` and
//! `~`. A bare version is an exact match; an empty string or `*` matches
//! everything. Several constraints joined with commas form a range that must
//! hold simultaneously (`">=1.0.0, <2.0.0"`).
//!
//! ```
//! use plugin_runtime::plugins::version::{Version, VersionConstraint};
//!
//! let constraint: VersionConstraint = "^1.2.3".parse().unwrap();
//! assert!(constraint.satisfies(&"1.9.9".parse::<Version>().unwrap()));
//! assert!(!constraint.satisfies(&"2.0.0".parse::<Version>().unwrap()));
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// A parsed semantic version. Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Pre-release label without the leading `-` (e.g. `alpha.1`).
    pub pre_release: Option<String>,
    /// Build metadata without the leading `+`. Not part of precedence.
    pub build: Option<String>,
}

impl Version {
    /// Create a release version with no pre-release or build labels.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
            build: None,
        }
    }

    /// True when the version carries a pre-release label.
    pub fn is_pre_release(&self) -> bool {
        self.pre_release.is_some()
    }

    fn next_major(&self) -> Self {
        Self::new(self.major.saturating_add(1), 0, 0)
    }

    fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor.saturating_add(1), 0)
    }
}

/// Parse a version string. Shorthand for `s.parse::<Version>()`.
pub fn parse_version(s: &str) -> Result<Version> {
    s.parse()
}

fn invalid_version(input: &str, reason: impl Into<String>) -> RuntimeError {
    RuntimeError::InvalidVersion {
        input: input.to_string(),
        reason: reason.into(),
    }
}

impl FromStr for Version {
    type Err = RuntimeError;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if body.is_empty() {
            return Err(invalid_version(input, "empty version string"));
        }

        let (body, build) = match body.split_once('+') {
            Some((core, build)) => (core, Some(build)),
            None => (body, None),
        };
        let (core, pre_release) = match body.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (body, None),
        };

        for (label, value) in [("pre-release", pre_release), ("build", build)] {
            if value.is_some_and(str::is_empty) {
                return Err(invalid_version(input, format!("empty {} label", label)));
            }
        }

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return Err(invalid_version(
                input,
                format!("expected at most 3 numeric components, found {}", parts.len()),
            ));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid_version(
                    input,
                    format!("component '{}' is not numeric", part),
                ));
            }
            *slot = part
                .parse()
                .map_err(|_| invalid_version(input, format!("component '{}' is too large", part)))?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre_release: pre_release.map(str::to_string),
            build: build.map(str::to_string),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre_release {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                // A release outranks any pre-release of the same triple.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Comparison operator of a [`VersionConstraint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// `*` or empty: matches any version.
    Any,
    /// `==`, `=` or a bare version.
    Exact,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    /// `^X.Y.Z`: `[X.Y.Z, (X+1).0.0)`.
    Caret,
    /// `~X.Y.Z`: `[X.Y.Z, X.(Y+1).0)`.
    Tilde,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Any => "*",
            Operator::Exact => "==",
            Operator::Greater => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::Less => "<",
            Operator::LessOrEqual => "<=",
            Operator::Caret => "^",
            Operator::Tilde => "~",
        }
    }
}

/// Operator tokens in longest-match-first order.
const OPERATOR_TOKENS: &[(&str, Operator)] = &[
    (">=", Operator::GreaterOrEqual),
    ("<=", Operator::LessOrEqual),
    ("==", Operator::Exact),
    ("=", Operator::Exact),
    ("^", Operator::Caret),
    ("~", Operator::Tilde),
    (">", Operator::Greater),
    ("<", Operator::Less),
];

/// A single predicate over versions. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionConstraint {
    operator: Operator,
    /// Operand as written; `None` only for [`Operator::Any`].
    version: Option<Version>,
    /// Inclusive lower bound derived for `^` and `~`.
    min: Option<Version>,
    /// Exclusive upper bound derived for `^` and `~`.
    max: Option<Version>,
}

impl VersionConstraint {
    /// The wildcard constraint.
    pub fn any() -> Self {
        Self {
            operator: Operator::Any,
            version: None,
            min: None,
            max: None,
        }
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Inclusive lower bound for range operators (`^`, `~`).
    pub fn min(&self) -> Option<&Version> {
        self.min.as_ref()
    }

    /// Exclusive upper bound for range operators (`^`, `~`).
    pub fn max(&self) -> Option<&Version> {
        self.max.as_ref()
    }

    pub fn is_wildcard(&self) -> bool {
        self.operator == Operator::Any
    }

    /// Evaluate the constraint against a version.
    pub fn satisfies(&self, candidate: &Version) -> bool {
        let Some(bound) = self.version.as_ref() else {
            return true;
        };
        match self.operator {
            Operator::Any => true,
            Operator::Exact => candidate == bound,
            Operator::Greater => candidate > bound,
            Operator::GreaterOrEqual => candidate >= bound,
            Operator::Less => candidate < bound,
            Operator::LessOrEqual => candidate <= bound,
            Operator::Caret | Operator::Tilde => {
                let above_min = self.min.as_ref().map_or(true, |min| candidate >= min);
                let below_max = self.max.as_ref().map_or(true, |max| candidate < max);
                above_min && below_max
            }
        }
    }

    /// Parse `version` and evaluate; unparseable versions never satisfy.
    pub fn satisfies_str(&self, version: &str) -> bool {
        version
            .parse::<Version>()
            .map(|v| self.satisfies(&v))
            .unwrap_or(false)
    }
}

/// Parse a constraint expression. Shorthand for `s.parse::<VersionConstraint>()`.
pub fn parse_constraint(s: &str) -> Result<VersionConstraint> {
    s.parse()
}

impl FromStr for VersionConstraint {
    type Err = RuntimeError;

    fn from_str(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::any());
        }

        let (operator, operand) = OPERATOR_TOKENS
            .iter()
            .find_map(|(token, op)| s.strip_prefix(token).map(|rest| (*op, rest.trim())))
            .unwrap_or((Operator::Exact, s));

        let version: Version = operand.parse::<Version>().map_err(|e| RuntimeError::InvalidConstraint {
            input: input.to_string(),
            reason: e.to_string(),
        })?;

        let (min, max) = match operator {
            Operator::Caret => (Some(version.clone()), Some(version.next_major())),
            Operator::Tilde => (Some(version.clone()), Some(version.next_minor())),
            _ => (None, None),
        };

        Ok(Self {
            operator,
            version: Some(version),
            min,
            max,
        })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            None => f.write_str("*"),
            Some(v) => write!(f, "{}{}", self.operator.symbol(), v),
        }
    }
}

/// Parse a comma-separated conjunction such as `">=1.0.0, <2.0.0"`.
///
/// Empty segments are ignored; an input with no segments yields a single
/// wildcard so the result is never empty.
pub fn parse_constraint_range(s: &str) -> Result<Vec<VersionConstraint>> {
    let constraints = s
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<VersionConstraint>>>()?;

    if constraints.is_empty() {
        return Ok(vec![VersionConstraint::any()]);
    }
    Ok(constraints)
}

/// True when every constraint holds for `version`.
pub fn satisfies_all(constraints: &[VersionConstraint], version: &Version) -> bool {
    constraints.iter().all(|c| c.satisfies(version))
}

/// Highest candidate satisfying every constraint, if any.
pub fn find_compatible_version<'a, I>(
    constraints: &[VersionConstraint],
    candidates: I,
) -> Option<&'a Version>
where
    I: IntoIterator<Item = &'a Version>,
{
    candidates
        .into_iter()
        .filter(|v| satisfies_all(constraints, v))
        .max()
}

/// Convenience check on raw strings, e.g. `satisfies("^1.2.3", "1.4.0")`.
pub fn satisfies(constraint: &str, version: &str) -> Result<bool> {
    let constraint: VersionConstraint = constraint.parse()?;
    let version: Version = version.parse()?;
    Ok(constraint.satisfies(&version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        s.parse().unwrap()
    }

    // ---- parsing ----

    #[test]
    fn test_parse_full_version() {
        let version = v("v1.2.3-beta.1+build.5");
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 2);
        assert_eq!(version.patch, 3);
        assert_eq!(version.pre_release.as_deref(), Some("beta.1"));
        assert_eq!(version.build.as_deref(), Some("build.5"));
    }

    #[test]
    fn test_parse_missing_components_default_to_zero() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.2"), Version::new(1, 2, 0));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "v", "1.x.3", "1.2.3.4", "a.b.c", "1..2", "1.2.3-", "-1.0.0"] {
            let err = bad.parse::<Version>().unwrap_err();
            assert!(
                matches!(err, RuntimeError::InvalidVersion { .. }),
                "expected InvalidVersion for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["0.0.1", "1.2.3", "10.20.30-rc.1", "1.0.0-alpha+001"] {
            let parsed = v(s);
            let reparsed = v(&parsed.to_string());
            assert_eq!(parsed, reparsed);
            assert_eq!(parsed.pre_release, reparsed.pre_release);
            assert_eq!(parsed.to_string(), s);
        }
    }

    // ---- ordering ----

    #[test]
    fn test_ordering_numeric_components() {
        assert!(v("1.10.0") > v("1.9.0"));
        assert!(v("2.0.0") > v("1.99.99"));
        assert!(v("1.0.1") > v("1.0.0"));
    }

    #[test]
    fn test_release_outranks_pre_release() {
        assert!(v("1.0.0") > v("1.0.0-rc.1"));
        assert!(v("1.0.0-beta") > v("1.0.0-alpha"));
    }

    #[test]
    fn test_build_metadata_ignored_for_equality() {
        assert_eq!(v("1.0.0+a"), v("1.0.0+b"));
    }

    // ---- constraint parsing ----

    #[test]
    fn test_constraint_operator_dispatch() {
        assert_eq!(c("").operator(), Operator::Any);
        assert_eq!(c("*").operator(), Operator::Any);
        assert_eq!(c("1.0.0").operator(), Operator::Exact);
        assert_eq!(c("==1.0.0").operator(), Operator::Exact);
        assert_eq!(c("=1.0.0").operator(), Operator::Exact);
        assert_eq!(c(">1.0.0").operator(), Operator::Greater);
        assert_eq!(c(">=1.0.0").operator(), Operator::GreaterOrEqual);
        assert_eq!(c("<1.0.0").operator(), Operator::Less);
        assert_eq!(c("<=1.0.0").operator(), Operator::LessOrEqual);
        assert_eq!(c("^1.0.0").operator(), Operator::Caret);
        assert_eq!(c("~1.0.0").operator(), Operator::Tilde);
        assert_eq!(c(">= 1.0.0").operator(), Operator::GreaterOrEqual);
    }

    #[test]
    fn test_constraint_derived_bounds() {
        let caret = c("^1.2.3");
        assert_eq!(caret.min(), Some(&v("1.2.3")));
        assert_eq!(caret.max(), Some(&v("2.0.0")));

        let tilde = c("~1.2.3");
        assert_eq!(tilde.min(), Some(&v("1.2.3")));
        assert_eq!(tilde.max(), Some(&v("1.3.0")));
    }

    #[test]
    fn test_constraint_rejects_bad_operand() {
        let err = ">=abc".parse::<VersionConstraint>().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConstraint { .. }));
    }

    // ---- satisfaction ----

    #[test]
    fn test_caret_satisfaction() {
        let caret = c("^1.2.3");
        assert!(caret.satisfies(&v("1.2.3")));
        assert!(caret.satisfies(&v("1.9.9")));
        assert!(!caret.satisfies(&v("1.2.2")));
        assert!(!caret.satisfies(&v("2.0.0")));
    }

    #[test]
    fn test_tilde_satisfaction() {
        let tilde = c("~1.2.3");
        assert!(tilde.satisfies(&v("1.2.3")));
        assert!(tilde.satisfies(&v("1.2.99")));
        assert!(!tilde.satisfies(&v("1.3.0")));
    }

    #[test]
    fn test_strict_greater_is_strict() {
        let gt = c(">1.2.3");
        assert!(!gt.satisfies(&v("1.2.3")));
        assert!(gt.satisfies(&v("1.2.4")));
        assert!(gt.satisfies(&v("2.0.0")));
    }

    #[test]
    fn test_inclusive_and_exclusive_bounds() {
        assert!(c(">=1.2.3").satisfies(&v("1.2.3")));
        assert!(c("<=1.2.3").satisfies(&v("1.2.3")));
        assert!(!c("<1.2.3").satisfies(&v("1.2.3")));
        assert!(c("<1.2.3").satisfies(&v("1.2.3-rc.1")));
    }

    #[test]
    fn test_exact_and_wildcard() {
        assert!(c("1.2.3").satisfies(&v("1.2.3")));
        assert!(!c("1.2.3").satisfies(&v("1.2.4")));
        assert!(c("*").satisfies(&v("0.0.1-alpha")));
    }

    #[test]
    fn test_constraint_display() {
        assert_eq!(c("^1.2").to_string(), "^1.2.0");
        assert_eq!(c("1.0.0").to_string(), "==1.0.0");
        assert_eq!(c("").to_string(), "*");
    }

    #[test]
    fn test_equivalent_spellings_are_equal() {
        assert_eq!(c("1.0.0"), c("==1.0.0"));
        assert_eq!(c(" =1.0.0 "), c("1.0.0"));
        assert_eq!(c(""), VersionConstraint::any());
        assert_ne!(c("^1.0.0"), c("~1.0.0"));
    }

    // ---- ranges ----

    #[test]
    fn test_constraint_range() {
        let range = parse_constraint_range(">=1.0.0, <2.0.0").unwrap();
        assert_eq!(range.len(), 2);
        assert!(satisfies_all(&range, &v("1.5.0")));
        assert!(!satisfies_all(&range, &v("2.0.0")));
        assert!(!satisfies_all(&range, &v("0.9.0")));
    }

    #[test]
    fn test_empty_range_is_wildcard() {
        let range = parse_constraint_range(" , ").unwrap();
        assert_eq!(range.len(), 1);
        assert!(range[0].is_wildcard());
    }

    #[test]
    fn test_find_compatible_version_picks_highest() {
        let candidates = vec![v("1.0.0"), v("1.4.2"), v("1.9.0"), v("2.1.0")];
        let range = parse_constraint_range("^1.2.0").unwrap();
        assert_eq!(find_compatible_version(&range, &candidates), Some(&v("1.9.0")));

        let none = parse_constraint_range(">3.0.0").unwrap();
        assert_eq!(find_compatible_version(&none, &candidates), None);
    }

    #[test]
    fn test_satisfies_helper() {
        assert!(satisfies("~2.1.0", "2.1.7").unwrap());
        assert!(!satisfies("~2.1.0", "2.2.0").unwrap());
        assert!(satisfies("~2.1.0", "bogus").is_err());
    }
}
