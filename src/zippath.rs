//! Stored-entry path handling: normalization, Unicode repair, and the
//! flat-mode presentation names.

use std::fmt::Write as _;

use sha1::Digest;
use sha1::Sha1;

/// Header id of the Info-ZIP Unicode Path Extra Field.
const UNICODE_PATH_FIELD: u16 = 0x7075;

/// Normalizes a stored entry path: backslashes become slashes, slash runs
/// collapse to one, a leading slash is dropped. A trailing slash
/// (directory marker) survives.
pub(crate) fn normalize(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &byte in raw {
        let byte = if byte == b'\\' { b'/' } else { byte };
        if byte == b'/' && out.last() == Some(&b'/') {
            continue;
        }
        out.push(byte);
    }
    if out.first() == Some(&b'/') {
        out.remove(0);
    }
    out
}

/// Whether an entry is a directory: its stored mode says so, or its
/// normalized path carries the trailing-slash marker.
pub(crate) fn is_directory(mode_is_dir: bool, name: &str) -> bool {
    mode_is_dir || name.ends_with('/')
}

/// Produces the presented name for a stored entry.
///
/// Valid UTF-8 names pass through normalization untouched. Invalid names
/// are repaired from the 0x7075 extra field when `force_unicode` is on,
/// falling back to synthesized placeholder components; with the option
/// off they degrade to lossy conversion. `ordinal` is the 1-based entry
/// position, used in file placeholders.
pub(crate) fn presented_name(
    raw: &[u8],
    extra: &[u8],
    ordinal: usize,
    force_unicode: bool,
) -> String {
    let normalized = normalize(raw);
    if let Ok(name) = std::str::from_utf8(&normalized) {
        return name.to_owned();
    }
    if !force_unicode {
        return String::from_utf8_lossy(&normalized).into_owned();
    }
    if let Some(name) = unicode_path_field(extra, raw) {
        return String::from_utf8_lossy(&normalize(name.as_bytes())).into_owned();
    }
    synthesize_name(&normalized, ordinal)
}

/// Extracts the UTF-8 name from the Info-ZIP Unicode Path field, if one is
/// present with version 1, a CRC-32 matching the stored name, and a valid
/// UTF-8 payload.
fn unicode_path_field(extra: &[u8], stored_name: &[u8]) -> Option<String> {
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let len = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
        let payload = rest.get(4..4 + len)?;
        if id == UNICODE_PATH_FIELD {
            if payload.len() < 5 || payload[0] != 1 {
                return None;
            }
            let crc = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            if crc != crc32fast::hash(stored_name) {
                return None;
            }
            return String::from_utf8(payload[5..].to_vec()).ok();
        }
        rest = &rest[4 + len..];
    }
    None
}

fn synthesize_name(normalized: &[u8], ordinal: usize) -> String {
    let trailing_dir = normalized.ends_with(b"/");
    let components: Vec<&[u8]> = normalized
        .split(|&byte| byte == b'/')
        .filter(|component| !component.is_empty())
        .collect();
    let mut repaired = Vec::with_capacity(components.len());
    for (position, component) in components.iter().enumerate() {
        let is_file = position + 1 == components.len() && !trailing_dir;
        match std::str::from_utf8(component) {
            Ok(component) => repaired.push(component.to_owned()),
            Err(_) if is_file => repaired.push(file_placeholder(component, ordinal)),
            Err(_) => repaired.push(dir_placeholder(component)),
        }
    }
    let mut joined = repaired.join("/");
    if trailing_dir {
        joined.push('/');
    }
    joined
}

fn file_placeholder(component: &[u8], ordinal: usize) -> String {
    match valid_extension(component) {
        Some(ext) => format!("noutf8_file({ordinal}){ext}"),
        None => format!("noutf8_file({ordinal})"),
    }
}

fn valid_extension(component: &[u8]) -> Option<&str> {
    let dot = component.iter().rposition(|&byte| byte == b'.')?;
    if dot == 0 {
        return None;
    }
    std::str::from_utf8(&component[dot..]).ok()
}

fn dir_placeholder(component: &[u8]) -> String {
    let digest = Sha1::digest(component);
    let mut hex = String::with_capacity(8);
    for byte in &digest[..4] {
        let _ = write!(hex, "{byte:02x}");
    }
    format!("noutf8_dir({hex})")
}

/// Builds the flat presentation name for an entry: the basename with the
/// 1-based entry ordinal spliced in before the extension. Ordinals are
/// unique per archive, so the mapping is injective and stable across
/// opens. Returns `None` for paths that escape the archive root.
pub(crate) fn flat_name(ordinal: usize, path: &str) -> Option<String> {
    let cleaned = clean(path)?;
    let base = match cleaned.rfind('/') {
        Some(slash) => &cleaned[slash + 1..],
        None => cleaned.as_str(),
    };
    let (stem, ext) = match base.rfind('.') {
        Some(0) | None => (base, ""),
        Some(dot) => base.split_at(dot),
    };
    Some(format!("{stem}({ordinal}){ext}"))
}

/// Lexically resolves `.` and `..`; `None` when the path is empty or
/// climbs out of the root.
fn clean(path: &str) -> Option<String> {
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                stack.pop()?;
            }
            component => stack.push(component),
        }
    }
    if stack.is_empty() {
        return None;
    }
    Some(stack.join("/"))
}
