//! Embedded prefix-path patching inside the Qt core DLL.
//!
//! Qt6Core.dll carries `qt_prfxpath=`/`qt_epfxpath=`/`qt_hpfxpath=` strings
//! pointing at the build host's install prefix, in both ASCII and UTF-16LE.
//! Each value is overwritten in place with `.` and zero-filled to its
//! original length, so the file never grows and section alignment is
//! preserved.

use std::fs;
use std::io;
use std::path::Path;

const PREFIX_KEYS: [&str; 3] = ["qt_prfxpath=", "qt_epfxpath=", "qt_hpfxpath="];
const REPLACEMENT: &str = ".";

/// Patch the staged Qt core DLL. Returns whether any bytes changed; the
/// file is rewritten only in that case, so re-running on an already patched
/// file is a no-op.
pub fn patch_qt_core_prefixes(dll_path: &Path) -> io::Result<bool> {
    if !dll_path.is_file() {
        return Ok(false);
    }
    let mut buf = fs::read(dll_path)?;
    if buf.is_empty() {
        return Ok(false);
    }

    let mut changed = false;
    for key in PREFIX_KEYS {
        changed |= patch_ascii_key(&mut buf, key.as_bytes(), REPLACEMENT.as_bytes());
        changed |= patch_utf16_key(&mut buf, key, REPLACEMENT);
    }

    if changed {
        fs::write(dll_path, &buf)?;
    }
    Ok(changed)
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

// Overwrite the value region after each key occurrence, provided it is at
// least as long as the replacement and not already patched.
fn patch_value(buf: &mut [u8], val_start: usize, val_end: usize, replacement: &[u8]) -> bool {
    let val_len = val_end - val_start;
    if val_len < replacement.len() {
        return false;
    }
    let value = &buf[val_start..val_end];
    let already_patched = value[..replacement.len()] == *replacement
        && value[replacement.len()..].iter().all(|&b| b == 0);
    if already_patched {
        return false;
    }
    buf[val_start..val_start + replacement.len()].copy_from_slice(replacement);
    buf[val_start + replacement.len()..val_end].fill(0);
    true
}

fn patch_ascii_key(buf: &mut Vec<u8>, key: &[u8], replacement: &[u8]) -> bool {
    let mut changed = false;
    let mut pos = 0;
    while let Some(hit) = find_subsequence(buf, key, pos) {
        let val_start = hit + key.len();
        let mut scan = val_start;
        while scan < buf.len() && buf[scan] != 0 {
            scan += 1;
        }
        if scan == val_start {
            pos = val_start;
            continue;
        }
        changed |= patch_value(buf, val_start, scan, replacement);
        pos = scan;
    }
    changed
}

fn utf16le_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn patch_utf16_key(buf: &mut Vec<u8>, key: &str, replacement: &str) -> bool {
    let key_bytes = utf16le_bytes(key);
    let replacement_bytes = utf16le_bytes(replacement);
    let mut changed = false;
    let mut pos = 0;
    while let Some(hit) = find_subsequence(buf, &key_bytes, pos) {
        let val_start = hit + key_bytes.len();
        let mut scan = val_start;
        // UTF-16LE values end at a double-null on a code-unit boundary.
        while scan + 1 < buf.len() && !(buf[scan] == 0 && buf[scan + 1] == 0) {
            scan += 2;
        }
        if scan == val_start {
            pos = val_start;
            continue;
        }
        changed |= patch_value(buf, val_start, scan, &replacement_bytes);
        pos = scan;
    }
    changed
}
