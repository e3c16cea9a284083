//! Reversible escaping of virtual names into portable file names.
//!
//! Characters that are not portable across host filesystems are replaced by
//! `%XX` (two hex digits) for code points up to `0xFF` and by `$XXXX` (four hex
//! digits) above that. Characters outside the basic multilingual plane are
//! written as their two UTF-16 code units. `%` and `$` are escaped themselves,
//! which keeps the mapping exactly reversible.

use std::fmt::Write as _;

const ILLEGAL: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '%', '$'];

fn needs_escape(c: char) -> bool {
    c.is_control() || c == '\u{7f}' || !c.is_ascii() || ILLEGAL.contains(&c)
}

/// Escape a single name (no path separators survive).
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if !needs_escape(c) {
            out.push(c);
            continue;
        }
        let code = c as u32;
        if code <= 0xff {
            let _ = write!(out, "%{code:02X}");
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "${unit:04X}");
            }
        }
    }
    out
}

/// Reverse [`encode`]. Text that is not a valid escape is kept literally.
pub fn decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = String::with_capacity(encoded.len());
    let mut units: Vec<u16> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' => {
                if let Some(unit) = hex_at(encoded, i + 1, 4) {
                    units.push(unit as u16);
                    i += 5;
                    continue;
                }
            }
            b'%' => {
                if let Some(code) = hex_at(encoded, i + 1, 2) {
                    flush_units(&mut units, &mut out);
                    out.push(char::from(code as u8));
                    i += 3;
                    continue;
                }
            }
            _ => {}
        }
        flush_units(&mut units, &mut out);
        // Multi-byte characters are copied whole.
        let ch_len = encoded[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&encoded[i..i + ch_len]);
        i += ch_len;
    }
    flush_units(&mut units, &mut out);
    out
}

fn hex_at(s: &str, start: usize, len: usize) -> Option<u32> {
    let digits = s.get(start..start + len)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

fn flush_units(units: &mut Vec<u16>, out: &mut String) {
    if units.is_empty() {
        return;
    }
    for decoded in char::decode_utf16(units.drain(..)) {
        out.push(decoded.unwrap_or(char::REPLACEMENT_CHARACTER));
    }
}

/// Escape every segment of a normalized path, keeping the separators.
pub fn encode_path(path: &str) -> String {
    path.split('/').map(encode).collect::<Vec<_>>().join("/")
}

/// Reverse [`encode_path`].
pub fn decode_path(path: &str) -> String {
    path.split('/').map(decode).collect::<Vec<_>>().join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_unchanged() {
        assert_eq!(encode("file1_1.txt"), "file1_1.txt");
        assert_eq!(encode("some name-with.dots"), "some name-with.dots");
        assert_eq!(decode("file1_1.txt"), "file1_1.txt");
    }

    #[test]
    fn test_escape_forms() {
        assert_eq!(encode("a:b"), "a%3Ab");
        assert_eq!(encode("100%"), "100%25");
        assert_eq!(encode("$HOME"), "%24HOME");
        assert_eq!(encode("é"), "%E9");
        assert_eq!(encode("€"), "$20AC");
        assert_eq!(encode("😀"), "$D83D$DE00");
    }

    #[test]
    fn test_round_trip() {
        let names = [
            "<>:\"/\\|?*%$",
            "settings:prod?.yaml",
            "naïve résumé",
            "日本語のファイル",
            "emoji 😀 mixed €",
            "tab\tand\nnewline",
            "%41 looks escaped",
            "$0041 too",
            "",
        ];
        for name in names {
            let encoded = encode(name);
            assert!(!encoded.contains('/'), "{encoded}");
            assert_eq!(decode(&encoded), name);
        }
    }

    #[test]
    fn test_decode_keeps_invalid_escapes() {
        assert_eq!(decode("50%"), "50%");
        assert_eq!(decode("$zz"), "$zz");
        assert_eq!(decode("%G1"), "%G1");
    }

    #[test]
    fn test_path_round_trip() {
        let path = "/dir:one/sub?/file*.txt";
        let encoded = encode_path(path);
        assert_eq!(encoded, "/dir%3Aone/sub%3F/file%2A.txt");
        assert_eq!(decode_path(&encoded), path);
    }
}
