// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Textual path parsing and name validation

use crate::config::{Profile, ProfileTraits};
use crate::error::{FsError, FsResult};

/// A parsed path request: name components plus an absolute flag.
///
/// `.` and `..` are kept as components; the resolver interprets them against
/// the inode graph rather than lexically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsPath {
    pub absolute: bool,
    pub names: Vec<String>,
}

impl FsPath {
    pub fn parse(traits: &ProfileTraits, text: &str) -> FsResult<Self> {
        let mut rest = text;
        let mut absolute = false;

        if traits.profile == Profile::Windows {
            let bytes = rest.as_bytes();
            if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
                rest = &rest[2..];
                absolute = true;
            }
        }
        if rest.starts_with(|c| traits.is_separator(c)) {
            absolute = true;
        }

        let mut names = Vec::new();
        for name in rest.split(|c| traits.is_separator(c)) {
            if name.is_empty() {
                continue;
            }
            if name != "." && name != ".." {
                validate_name(traits, name)?;
            }
            names.push(name.to_string());
        }

        Ok(Self { absolute, names })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    /// Lexically normalized form: `.` dropped, `..` folded, clamped at root.
    pub fn normalize(&self) -> FsPath {
        let mut names: Vec<String> = Vec::with_capacity(self.names.len());
        for name in &self.names {
            match name.as_str() {
                "." => {}
                ".." => {
                    if names.last().is_some_and(|last| last != "..") {
                        names.pop();
                    } else if !self.absolute {
                        names.push(name.clone());
                    }
                }
                _ => names.push(name.clone()),
            }
        }
        Self {
            absolute: self.absolute,
            names,
        }
    }

    pub fn render(&self, traits: &ProfileTraits) -> String {
        render_names(traits, self.absolute, &self.names)
    }
}

pub(crate) fn render_names<S: AsRef<str>>(
    traits: &ProfileTraits,
    absolute: bool,
    names: &[S],
) -> String {
    let sep = traits.separator.to_string();
    let joined = names.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(&sep);
    if absolute {
        format!("{}{}", traits.root_display(), joined)
    } else {
        joined
    }
}

/// Reject names the profile cannot store.
pub fn validate_name(traits: &ProfileTraits, name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidName);
    }
    if name.contains('\0') || name.chars().any(|c| traits.is_separator(c)) {
        return Err(FsError::InvalidName);
    }
    if traits.profile == Profile::Windows && name.chars().any(|c| (c as u32) < 32) {
        return Err(FsError::InvalidName);
    }
    if name.chars().any(|c| traits.forbidden_chars.contains(&c)) {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_paths() {
        let traits = Profile::Unix.traits();
        let path = FsPath::parse(&traits, "/a//b/./c/").expect("parse");
        assert!(path.absolute);
        assert_eq!(path.names, vec!["a", "b", ".", "c"]);
        assert_eq!(path.normalize().render(&traits), "/a/b/c");

        let relative = FsPath::parse(&traits, "x/../../y").expect("parse");
        assert!(!relative.absolute);
        assert_eq!(relative.normalize().names, vec!["..", "y"]);
    }

    #[test]
    fn parses_windows_paths_with_both_separators() {
        let traits = Profile::Windows.traits();
        let path = FsPath::parse(&traits, "C:\\Users/dev\\file.txt").expect("parse");
        assert!(path.absolute);
        assert_eq!(path.names, vec!["Users", "dev", "file.txt"]);
        assert_eq!(path.render(&traits), "C:\\Users\\dev\\file.txt");
    }

    #[test]
    fn rejects_forbidden_names() {
        let windows = Profile::Windows.traits();
        assert!(matches!(
            FsPath::parse(&windows, "C:\\a?b"),
            Err(FsError::InvalidName)
        ));
        let unix = Profile::Unix.traits();
        assert!(FsPath::parse(&unix, "/a?b").is_ok());
        assert!(matches!(
            FsPath::parse(&unix, "/a\0b"),
            Err(FsError::InvalidName)
        ));
    }

    #[test]
    fn normalize_clamps_at_root() {
        let traits = Profile::Unix.traits();
        let path = FsPath::parse(&traits, "/../../a").expect("parse");
        assert_eq!(path.normalize().render(&traits), "/a");
    }
}
