// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `glob:` and `regex:` path matchers

use regex::{Regex, RegexBuilder};

use crate::config::{CaseSensitivity, ProfileTraits};
use crate::error::{FsError, FsResult};

/// Compiled, anchored path matcher
#[derive(Clone, Debug)]
pub struct PathMatcher {
    source: String,
    regex: Regex,
}

impl PathMatcher {
    /// Parses `syntax:pattern`, where syntax is `glob` or `regex`.
    pub fn new(traits: &ProfileTraits, syntax_and_pattern: &str) -> FsResult<Self> {
        let (syntax, pattern) = syntax_and_pattern
            .split_once(':')
            .ok_or(FsError::InvalidArgument)?;
        let expression = match syntax.to_ascii_lowercase().as_str() {
            "glob" => glob_to_regex(traits, pattern)?,
            "regex" => pattern.to_string(),
            _ => return Err(FsError::Unsupported),
        };
        Self::compile(traits, syntax_and_pattern, &expression)
    }

    pub fn glob(traits: &ProfileTraits, pattern: &str) -> FsResult<Self> {
        let expression = glob_to_regex(traits, pattern)?;
        Self::compile(traits, pattern, &expression)
    }

    fn compile(traits: &ProfileTraits, source: &str, expression: &str) -> FsResult<Self> {
        let regex = RegexBuilder::new(&format!("^(?:{expression})$"))
            .case_insensitive(traits.case_sensitivity == CaseSensitivity::InsensitivePreserving)
            .build()
            .map_err(|err| FsError::InvalidPattern(err.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn separator_class(traits: &ProfileTraits) -> String {
    let mut class = regex::escape(&traits.separator.to_string());
    if let Some(alt) = traits.alt_separator {
        class.push_str(&regex::escape(&alt.to_string()));
    }
    class
}

/// Translates glob syntax into a regular expression body (unanchored).
pub fn glob_to_regex(traits: &ProfileTraits, glob: &str) -> FsResult<String> {
    let seps = separator_class(traits);
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2);
    let mut in_group = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| FsError::InvalidPattern("dangling escape".into()))?;
                out.push_str(&regex::escape(&escaped.to_string()));
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                out.push_str(".*");
                i += 1;
            }
            '*' => out.push_str(&format!("[^{seps}]*")),
            '?' => out.push_str(&format!("[^{seps}]")),
            '[' => {
                i = push_class(traits, &chars, i, &mut out)?;
            }
            '{' => {
                if in_group {
                    return Err(FsError::InvalidPattern("nested groups".into()));
                }
                in_group = true;
                out.push_str("(?:");
            }
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            c if traits.is_separator(c) => out.push_str(&format!("[{seps}]")),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    if in_group {
        return Err(FsError::InvalidPattern("missing '}'".into()));
    }
    Ok(out)
}

/// Emits a `[...]` class starting at `start`; returns the index of its `]`.
fn push_class(
    traits: &ProfileTraits,
    chars: &[char],
    start: usize,
    out: &mut String,
) -> FsResult<usize> {
    let mut i = start + 1;
    out.push('[');
    if matches!(chars.get(i), Some('!') | Some('^')) {
        out.push('^');
        i += 1;
    }
    let mut first = true;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ']' if !first => {
                out.push(']');
                return Ok(i);
            }
            c if traits.is_separator(c) => {
                return Err(FsError::InvalidPattern(
                    "separator inside character class".into(),
                ));
            }
            '-' if !first && chars.get(i + 1).is_some_and(|next| *next != ']') => out.push('-'),
            '\\' | '[' | ']' | '&' | '~' | '-' | '^' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
        first = false;
        i += 1;
    }
    Err(FsError::InvalidPattern("missing ']'".into()))
}
