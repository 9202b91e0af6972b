// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Construction-time configuration for [`crate::FsCore`]

use serde::{Deserialize, Serialize};

use crate::fault::FaultPolicy;

/// Operating system flavour whose semantics the filesystem emulates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Unix,
    Windows,
    Mac,
}

/// Name comparison rule for directory entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSensitivity {
    Sensitive,
    /// Lookups ignore case, listings keep the originally inserted spelling
    InsensitivePreserving,
}

/// How `delete_on_close` opens behave
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOnClose {
    /// POSIX: the entry is unlinked at open time, content lives on in the handle
    UnlinkOnOpen,
    /// Windows: the entry stays visible, new opens are refused and the entry
    /// is removed once the last delete-on-close handle is closed
    RemoveOnLastClose,
}

/// How many MODIFY events a single write contributes to a watch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifyCount {
    /// One event per operation regardless of what it touched
    PerOperation,
    /// Content and metadata changes of one operation are counted separately
    PerChange,
}

/// Behavioral knobs of a profile, consulted by every component.
#[derive(Clone, Debug)]
pub struct ProfileTraits {
    pub profile: Profile,
    pub separator: char,
    pub alt_separator: Option<char>,
    pub case_sensitivity: CaseSensitivity,
    pub delete_on_close: DeleteOnClose,
    /// Attribute views the profile exposes
    pub views: &'static [&'static str],
    /// Characters never allowed in a name (NUL is always rejected)
    pub forbidden_chars: &'static [char],
    /// `create_new` on an existing file succeeds when the open has no write access
    pub lenient_create_new: bool,
    /// Files with open handles may be deleted
    pub delete_open_files: bool,
    pub modify_count: ModifyCount,
}

const UNIX_VIEWS: &[&str] = &["basic", "owner", "posix", "unix"];
const MAC_VIEWS: &[&str] = &["basic", "owner", "posix"];
const WINDOWS_VIEWS: &[&str] = &["basic", "owner", "dos"];
const WINDOWS_FORBIDDEN: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

impl Profile {
    pub fn traits(self) -> ProfileTraits {
        match self {
            Profile::Unix => ProfileTraits {
                profile: self,
                separator: '/',
                alt_separator: None,
                case_sensitivity: CaseSensitivity::Sensitive,
                delete_on_close: DeleteOnClose::UnlinkOnOpen,
                views: UNIX_VIEWS,
                forbidden_chars: &[],
                lenient_create_new: true,
                delete_open_files: true,
                modify_count: ModifyCount::PerOperation,
            },
            Profile::Mac => ProfileTraits {
                profile: self,
                separator: '/',
                alt_separator: None,
                case_sensitivity: CaseSensitivity::InsensitivePreserving,
                delete_on_close: DeleteOnClose::UnlinkOnOpen,
                views: MAC_VIEWS,
                forbidden_chars: &[],
                lenient_create_new: true,
                delete_open_files: true,
                modify_count: ModifyCount::PerChange,
            },
            Profile::Windows => ProfileTraits {
                profile: self,
                separator: '\\',
                alt_separator: Some('/'),
                case_sensitivity: CaseSensitivity::InsensitivePreserving,
                delete_on_close: DeleteOnClose::RemoveOnLastClose,
                views: WINDOWS_VIEWS,
                forbidden_chars: WINDOWS_FORBIDDEN,
                lenient_create_new: true,
                delete_open_files: false,
                modify_count: ModifyCount::PerOperation,
            },
        }
    }
}

impl ProfileTraits {
    pub fn is_separator(&self, c: char) -> bool {
        c == self.separator || Some(c) == self.alt_separator
    }

    pub fn supports_view(&self, view: &str) -> bool {
        self.views.contains(&view)
    }

    pub fn root_display(&self) -> &'static str {
        match self.profile {
            Profile::Windows => "C:\\",
            Profile::Unix | Profile::Mac => "/",
        }
    }
}

/// Ownership and permission policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Check owner permission bits on open
    pub enforce_permissions: bool,
    pub default_uid: u32,
    pub default_gid: u32,
    pub default_owner: String,
    pub default_group: String,
    /// Symlink creation is permitted (Windows hosts commonly restrict it)
    pub allow_symlinks: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enforce_permissions: false,
            default_uid: 0,
            default_gid: 0,
            default_owner: "root".to_string(),
            default_group: "root".to_string(),
            allow_symlinks: true,
        }
    }
}

/// Watch event policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchPolicy {
    /// Overrides the profile's coalescing rule when set
    pub modify_count: Option<ModifyCount>,
}

/// Filesystem configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub profile: Profile,
    /// Quota limit for all live file content, in bytes
    pub total_space: u64,
    pub max_symlink_hops: u32,
    /// Record a backtrace when resources are opened, for leak reports
    pub capture_stack_traces: bool,
    pub watch: WatchPolicy,
    pub security: SecurityPolicy,
    pub faults: FaultPolicy,
}

pub const DEFAULT_TOTAL_SPACE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_SYMLINK_HOPS: u32 = 32;

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            total_space: DEFAULT_TOTAL_SPACE,
            max_symlink_hops: DEFAULT_MAX_SYMLINK_HOPS,
            capture_stack_traces: false,
            watch: WatchPolicy::default(),
            security: SecurityPolicy::default(),
            faults: FaultPolicy::default(),
        }
    }
}

impl FsConfig {
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    pub fn with_total_space(mut self, total_space: u64) -> Self {
        self.total_space = total_space;
        self
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Profile traits with config overrides applied
    pub fn traits(&self) -> ProfileTraits {
        let mut traits = self.profile.traits();
        if let Some(count) = self.watch.modify_count {
            traits.modify_count = count;
        }
        traits
    }
}
