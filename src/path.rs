//! Virtual path model shared by every backend.
//!
//! Paths are `/`-separated strings. A normalized path always starts with `/`,
//! never contains empty, `.` or `..` segments and never climbs above the root.
//! A trailing `/` marks a directory and survives normalization.

use std::cmp::Ordering;

/// The root directory.
pub const ROOT: &str = "/";

/// Normalize a single path.
///
/// Backslashes count as separators, repeated slashes collapse, `.` segments
/// vanish and `..` removes the preceding segment (an excess `..` at the root
/// is dropped). The empty string is the root.
pub fn normalize(path: &str) -> String {
    normalize_all([path])
}

/// Join all parts with `/` and normalize the result.
pub fn normalize_all<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = parts
        .into_iter()
        .map(|p| p.as_ref().replace('\\', "/"))
        .collect::<Vec<_>>()
        .join("/");

    let marks_dir = joined.is_empty()
        || joined.ends_with('/')
        || joined.ends_with("/.")
        || joined.ends_with("/..")
        || joined == "."
        || joined == "..";

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }

    if segments.is_empty() {
        return ROOT.to_string();
    }
    let mut normalized = String::with_capacity(joined.len() + 2);
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if marks_dir {
        normalized.push('/');
    }
    normalized
}

/// Normalized parent directory of `path`, always ending in `/`.
///
/// The parent of the root is the root.
pub fn parent_of(path: &str) -> String {
    normalize_all([path, "/../"])
}

/// True when `path` denotes a directory (empty or trailing slash).
pub fn is_dir(path: &str) -> bool {
    path.is_empty() || path.ends_with('/')
}

/// Normalized directory form of `path` (exactly one trailing slash).
pub fn dir_form(path: &str) -> String {
    let normalized = normalize(path);
    if normalized.ends_with('/') {
        normalized
    } else {
        normalized + "/"
    }
}

/// Normalized file form of `path` (no trailing slash, except for the root).
pub fn file_form(path: &str) -> String {
    let normalized = normalize(path);
    if normalized.len() > 1 {
        normalized.trim_end_matches('/').to_string()
    } else {
        normalized
    }
}

/// Last segment of `path`, keeping a trailing `/` for directories.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    let start = trimmed.rfind('/').map(|i| i + 1).unwrap_or(0);
    &path[start..]
}

/// Compare two paths the way listings are ordered: case-insensitive, with
/// runs of digits compared by numeric value (`file2` sorts before `file10`).
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let ln = take_number(&mut left);
                let rn = take_number(&mut right);
                let ord = ln
                    .trim_start_matches('0')
                    .len()
                    .cmp(&rn.trim_start_matches('0').len())
                    .then_with(|| ln.trim_start_matches('0').cmp(rn.trim_start_matches('0')));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l.to_lowercase().cmp(r.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}
