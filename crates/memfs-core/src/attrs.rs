// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Attribute views: `basic`, `owner`, `posix`, `dos` and `unix`.
//!
//! Attributes are addressed as `view:name` (the view defaults to `basic`).
//! Bulk reads accept `view:*` or a comma separated list of names.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::config::ProfileTraits;
use crate::error::{FsError, FsResult};
use crate::node::Node;
use crate::types::NodeId;

/// Value of a single attribute
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    Time(SystemTime),
    Text(String),
    /// Permission bits, `0o7777` at most
    Permissions(u32),
    FileKey(NodeId),
}

const BASIC: &[&str] = &[
    "size",
    "creationTime",
    "lastModifiedTime",
    "lastAccessTime",
    "isDirectory",
    "isRegularFile",
    "isSymbolicLink",
    "isOther",
    "fileKey",
];
const OWNER: &[&str] = &["owner"];
const POSIX: &[&str] = &["owner", "group", "permissions"];
const DOS: &[&str] = &["hidden", "readonly", "system", "archive"];
const UNIX: &[&str] = &[
    "owner", "group", "permissions", "ino", "uid", "gid", "mode", "nlink", "rdev", "dev", "ctime",
];

/// Names a view exposes, including those it inherits from `basic`
fn view_attributes(view: &str) -> Vec<&'static str> {
    let own: &[&str] = match view {
        "basic" => &[],
        "owner" => return OWNER.to_vec(),
        "posix" => POSIX,
        "dos" => DOS,
        "unix" => UNIX,
        _ => return Vec::new(),
    };
    BASIC.iter().chain(own.iter()).copied().collect()
}

fn split_view<'a>(traits: &ProfileTraits, spec: &'a str) -> FsResult<(&'a str, &'a str)> {
    let (view, rest) = spec.split_once(':').unwrap_or(("basic", spec));
    if !traits.supports_view(view) {
        return Err(FsError::ViewNotAvailable(view.to_string()));
    }
    Ok((view, rest))
}

fn value_of(node: &Node, name: &str) -> Option<AttrValue> {
    let attrs = node.attributes();
    Some(match name {
        "size" => AttrValue::U64(attrs.size),
        "creationTime" => AttrValue::Time(attrs.times.created),
        "lastModifiedTime" | "ctime" => AttrValue::Time(attrs.times.modified),
        "lastAccessTime" => AttrValue::Time(attrs.times.accessed),
        "isDirectory" => AttrValue::Bool(attrs.is_dir()),
        "isRegularFile" => AttrValue::Bool(attrs.is_file()),
        "isSymbolicLink" => AttrValue::Bool(attrs.is_symlink()),
        "isOther" => AttrValue::Bool(false),
        "fileKey" => AttrValue::FileKey(attrs.file_key),
        "owner" => AttrValue::Text(attrs.owner),
        "group" => AttrValue::Text(attrs.group),
        "permissions" => AttrValue::Permissions(node.mode & 0o7777),
        "hidden" => AttrValue::Bool(attrs.dos.hidden),
        "readonly" => AttrValue::Bool(attrs.dos.readonly),
        "system" => AttrValue::Bool(attrs.dos.system),
        "archive" => AttrValue::Bool(attrs.dos.archive),
        "ino" => AttrValue::U64(attrs.file_key.as_u64()),
        "uid" => AttrValue::U32(attrs.uid),
        "gid" => AttrValue::U32(attrs.gid),
        "mode" => AttrValue::U32(attrs.mode),
        "nlink" => AttrValue::U32(attrs.nlink),
        "rdev" => AttrValue::U64(node.rdev),
        "dev" => AttrValue::U64(0),
        _ => return None,
    })
}

/// Reads one `view:name` attribute.
pub(crate) fn get(traits: &ProfileTraits, node: &Node, spec: &str) -> FsResult<AttrValue> {
    let (view, name) = split_view(traits, spec)?;
    if !view_attributes(view).contains(&name) {
        return Err(FsError::AttributeNotRecognized(spec.to_string()));
    }
    value_of(node, name).ok_or_else(|| FsError::AttributeNotRecognized(spec.to_string()))
}

/// Reads `view:*` or `view:a,b,c` into a name-keyed map.
pub(crate) fn read(
    traits: &ProfileTraits,
    node: &Node,
    spec: &str,
) -> FsResult<BTreeMap<String, AttrValue>> {
    let (view, names) = split_view(traits, spec)?;
    let available = view_attributes(view);
    let wanted: Vec<&str> = if names == "*" {
        available.clone()
    } else {
        names.split(',').map(str::trim).collect()
    };

    let mut out = BTreeMap::new();
    for name in wanted {
        if !available.contains(&name) {
            return Err(FsError::AttributeNotRecognized(format!("{view}:{name}")));
        }
        if let Some(value) = value_of(node, name) {
            out.insert(name.to_string(), value);
        }
    }
    Ok(out)
}

/// Writes one attribute. Read-only attributes and mismatched value types
/// are rejected with `InvalidArgument`.
pub(crate) fn set(
    traits: &ProfileTraits,
    node: &mut Node,
    spec: &str,
    value: AttrValue,
) -> FsResult<()> {
    let (view, name) = split_view(traits, spec)?;
    if !view_attributes(view).contains(&name) {
        return Err(FsError::AttributeNotRecognized(spec.to_string()));
    }
    match (name, value) {
        ("creationTime", AttrValue::Time(at)) => node.times.created = at,
        ("lastModifiedTime", AttrValue::Time(at)) => node.times.modified = at,
        ("lastAccessTime", AttrValue::Time(at)) => node.times.accessed = at,
        ("owner", AttrValue::Text(owner)) => node.owner = owner,
        ("group", AttrValue::Text(group)) => node.group = group,
        ("permissions", AttrValue::Permissions(bits)) => {
            node.mode = (node.mode & !0o777) | (bits & 0o777)
        }
        ("hidden", AttrValue::Bool(flag)) => node.dos.hidden = flag,
        ("readonly", AttrValue::Bool(flag)) => node.dos.readonly = flag,
        ("system", AttrValue::Bool(flag)) => node.dos.system = flag,
        ("archive", AttrValue::Bool(flag)) => node.dos.archive = flag,
        ("uid", AttrValue::U32(uid)) => node.uid = uid,
        ("gid", AttrValue::U32(gid)) => node.gid = gid,
        ("mode", AttrValue::U32(mode)) => node.mode = mode & 0o7777,
        _ => return Err(FsError::InvalidArgument),
    }
    Ok(())
}

/// Renders permission bits as `rwxr-x---`.
pub fn permissions_to_string(bits: u32) -> String {
    const FLAGS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    FLAGS
        .iter()
        .map(|(bit, c)| if bits & bit != 0 { *c } else { '-' })
        .collect()
}

/// Parses `rwxr-x---` into permission bits.
pub fn parse_permissions(text: &str) -> FsResult<u32> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() != 9 {
        return Err(FsError::InvalidArgument);
    }
    let mut bits = 0u32;
    for (i, c) in chars.iter().enumerate() {
        let expected = ['r', 'w', 'x'][i % 3];
        match *c {
            '-' => {}
            c if c == expected => bits |= 1 << (8 - i),
            _ => return Err(FsError::InvalidArgument),
        }
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaseSensitivity, Profile, SecurityPolicy};
    use crate::node::NodeStore;
    use std::time::{Duration, UNIX_EPOCH};

    fn file_node() -> (NodeStore, NodeId) {
        let mut store = NodeStore::new(
            CaseSensitivity::Sensitive,
            &SecurityPolicy::default(),
            UNIX_EPOCH,
        );
        let id = store.create_file(&SecurityPolicy::default(), UNIX_EPOCH);
        (store, id)
    }

    #[test]
    fn basic_view_is_default() {
        let (store, id) = file_node();
        let traits = Profile::Unix.traits();
        let node = store.get(id).expect("node");
        assert_eq!(get(&traits, node, "size").expect("size"), AttrValue::U64(0));
        assert_eq!(
            get(&traits, node, "basic:isRegularFile").expect("type"),
            AttrValue::Bool(true)
        );
        assert_eq!(get(&traits, node, "fileKey").expect("key"), AttrValue::FileKey(id));
    }

    #[test]
    fn view_and_attribute_errors_are_distinct() {
        let (store, id) = file_node();
        let node = store.get(id).expect("node");
        let unix = Profile::Unix.traits();
        assert!(matches!(
            get(&unix, node, "dos:hidden"),
            Err(FsError::ViewNotAvailable(view)) if view == "dos"
        ));
        assert!(matches!(
            get(&unix, node, "posix:hidden"),
            Err(FsError::AttributeNotRecognized(_))
        ));
        let windows = Profile::Windows.traits();
        assert!(matches!(
            get(&windows, node, "unix:uid"),
            Err(FsError::ViewNotAvailable(_))
        ));
        assert!(get(&windows, node, "dos:hidden").is_ok());
    }

    #[test]
    fn bulk_read_lists_inherited_attributes() {
        let (store, id) = file_node();
        let node = store.get(id).expect("node");
        let traits = Profile::Unix.traits();
        let all = read(&traits, node, "unix:*").expect("read");
        assert!(all.contains_key("size"));
        assert!(all.contains_key("nlink"));
        assert_eq!(all.get("permissions"), Some(&AttrValue::Permissions(0o644)));

        let some = read(&traits, node, "posix:owner,group").expect("read");
        assert_eq!(some.len(), 2);
        assert!(matches!(
            read(&traits, node, "posix:owner,bogus"),
            Err(FsError::AttributeNotRecognized(_))
        ));
    }

    #[test]
    fn set_checks_types_and_writability() {
        let (mut store, id) = file_node();
        let traits = Profile::Unix.traits();
        let node = store.get_mut(id).expect("node");
        let later = UNIX_EPOCH + Duration::from_secs(60);
        set(&traits, node, "lastModifiedTime", AttrValue::Time(later)).expect("set");
        assert_eq!(node.times.modified, later);
        set(&traits, node, "posix:permissions", AttrValue::Permissions(0o600)).expect("set");
        assert_eq!(node.mode & 0o777, 0o600);
        assert!(matches!(
            set(&traits, node, "size", AttrValue::U64(3)),
            Err(FsError::InvalidArgument)
        ));
        assert!(matches!(
            set(&traits, node, "unix:uid", AttrValue::Text("x".into())),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn permission_strings() {
        assert_eq!(permissions_to_string(0o754), "rwxr-xr--");
        assert_eq!(parse_permissions("rw-r-----").expect("parse"), 0o640);
        assert!(parse_permissions("rwx").is_err());
        assert!(parse_permissions("xwrxwrxwr").is_err());
    }
}
