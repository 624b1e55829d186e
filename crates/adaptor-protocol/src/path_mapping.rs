//! Path mapping rules handed to an adaptor at start.
//!
//! A rule rewrites paths under `source_path`, written in the
//! `source_path_format` convention, to the same relative location under
//! `destination_path`. Matching works on whole path components, so
//! `/mnt/a` never matches `/mnt/ab`. Windows paths compare without regard
//! to case and accept either separator.
//!
//! On the command line the rules arrive as
//! `{"path_mapping_rules": [{"source_path_format": "windows", ...}]}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path convention of one side of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathFormat {
    /// Drive letters, `\` separators and case-insensitive names.
    #[serde(rename = "windows", alias = "WINDOWS")]
    Windows,
    /// `/` separators and case-sensitive names.
    #[serde(rename = "linux", alias = "posix", alias = "POSIX", alias = "macos")]
    Posix,
}

impl PathFormat {
    /// Convention of the machine this runs on.
    #[must_use]
    pub const fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Posix
        }
    }

    const fn separator(self) -> char {
        match self {
            Self::Windows => '\\',
            Self::Posix => '/',
        }
    }

    fn split(self, path: &str) -> PathParts {
        match self {
            Self::Posix => {
                let anchor = if path.starts_with('/') { "/" } else { "" };
                PathParts::new(anchor.to_owned(), path.split('/'))
            }
            Self::Windows => {
                let mut chars = path.chars();
                let (drive, rest) = match (chars.next(), chars.next()) {
                    (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => {
                        (format!("{letter}:"), chars.as_str())
                    }
                    _ => (String::new(), path),
                };
                let mut anchor = drive;
                if rest.starts_with(['/', '\\']) {
                    anchor.push('\\');
                }
                PathParts::new(anchor, rest.split(['/', '\\']))
            }
        }
    }

    fn same_name(self, left: &str, right: &str) -> bool {
        match self {
            Self::Posix => left == right,
            Self::Windows => left.to_lowercase() == right.to_lowercase(),
        }
    }
}

/// A path broken into its anchor (root, drive or both) and its names.
#[derive(Debug, PartialEq, Eq)]
struct PathParts {
    anchor: String,
    names: Vec<String>,
}

impl PathParts {
    fn new<'a>(anchor: String, names: impl Iterator<Item = &'a str>) -> Self {
        Self {
            anchor,
            names: names
                .filter(|name| !name.is_empty() && *name != ".")
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Names left after `prefix`, when `prefix` covers the start of `self`.
    fn strip_prefix<'a>(&'a self, prefix: &Self, format: PathFormat) -> Option<&'a [String]> {
        if !format.same_name(&self.anchor, &prefix.anchor) {
            return None;
        }
        let (head, rest) = self.names.split_at_checked(prefix.names.len())?;
        head.iter()
            .zip(&prefix.names)
            .all(|(name, wanted)| format.same_name(name, wanted))
            .then_some(rest)
    }

    fn render(&self, extra: &[String], format: PathFormat) -> String {
        let separator = format.separator().to_string();
        let names: Vec<&str> = self.names.iter().chain(extra).map(String::as_str).collect();
        format!("{}{}", self.anchor, names.join(&separator))
    }
}

/// A rule that failed validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathMappingError {
    /// `source_path` was empty.
    #[error("path mapping rule has an empty source_path")]
    EmptySource,
    /// `destination_path` was empty.
    #[error("path mapping rule has an empty destination_path")]
    EmptyDestination,
}

#[derive(Deserialize)]
struct RuleFields {
    source_path_format: PathFormat,
    source_path: String,
    destination_path: String,
    #[serde(default)]
    destination_os: Option<PathFormat>,
}

/// Rewrites paths under one directory to another directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleFields")]
pub struct PathMappingRule {
    source_path_format: PathFormat,
    source_path: String,
    destination_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_os: Option<PathFormat>,
}

impl TryFrom<RuleFields> for PathMappingRule {
    type Error = PathMappingError;

    fn try_from(fields: RuleFields) -> Result<Self, Self::Error> {
        let rule = Self::new(fields.source_path_format, fields.source_path, fields.destination_path)?;
        Ok(match fields.destination_os {
            Some(format) => rule.with_destination_os(format),
            None => rule,
        })
    }
}

impl PathMappingRule {
    /// Builds a rule whose destination uses the host's convention.
    ///
    /// # Errors
    ///
    /// Returns [`PathMappingError`] when either path is empty.
    pub fn new(
        source_path_format: PathFormat,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
    ) -> Result<Self, PathMappingError> {
        let source_path = source_path.into();
        let destination_path = destination_path.into();
        if source_path.is_empty() {
            return Err(PathMappingError::EmptySource);
        }
        if destination_path.is_empty() {
            return Err(PathMappingError::EmptyDestination);
        }
        Ok(Self {
            source_path_format,
            source_path,
            destination_path,
            destination_os: None,
        })
    }

    /// Renders mapped paths in `format` instead of the host's convention.
    #[must_use]
    pub const fn with_destination_os(mut self, format: PathFormat) -> Self {
        self.destination_os = Some(format);
        self
    }

    /// Directory this rule maps from.
    #[must_use]
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Directory this rule maps to.
    #[must_use]
    pub fn destination_path(&self) -> &str {
        &self.destination_path
    }

    /// Convention of `source_path` and of the paths this rule accepts.
    #[must_use]
    pub const fn source_path_format(&self) -> PathFormat {
        self.source_path_format
    }

    /// Convention mapped paths are written in.
    #[must_use]
    pub const fn destination_os(&self) -> PathFormat {
        match self.destination_os {
            Some(format) => format,
            None => PathFormat::host(),
        }
    }

    /// Maps `path`, or returns `None` when it is not under `source_path`.
    #[must_use]
    pub fn apply(&self, path: &str) -> Option<String> {
        let format = self.source_path_format;
        let parts = format.split(path);
        let rest = parts.strip_prefix(&format.split(&self.source_path), format)?;
        let destination_format = self.destination_os();
        Some(destination_format.split(&self.destination_path).render(rest, destination_format))
    }
}

/// The ordered rules an adaptor was started with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    #[serde(default)]
    path_mapping_rules: Vec<PathMappingRule>,
}

impl PathMapping {
    /// Wraps rules, tried in order.
    #[must_use]
    pub const fn new(rules: Vec<PathMappingRule>) -> Self {
        Self {
            path_mapping_rules: rules,
        }
    }

    /// The rules, in the order they are tried.
    #[must_use]
    pub fn rules(&self) -> &[PathMappingRule] {
        &self.path_mapping_rules
    }

    /// Whether there are no rules.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.path_mapping_rules.is_empty()
    }

    /// Applies the first rule that matches `path`; unmatched paths come
    /// back unchanged.
    #[must_use]
    pub fn map_path(&self, path: &str) -> String {
        self.path_mapping_rules
            .iter()
            .find_map(|rule| rule.apply(path))
            .unwrap_or_else(|| path.to_owned())
    }
}
