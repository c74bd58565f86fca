//! Line formats for replaying captured notification payloads.
//!
//! A payload line is either `hex:<bytes>` (raw binary, e.g. `hex:5f48`) or any
//! other text, sent as its UTF-8 bytes. Stdin feeds for the daemon prefix each
//! payload with its source: `wrist O2:97.5,HR:88`.

use crate::sample::SourceTag;

/// Turn one capture line into payload bytes.
pub fn parse_payload(line: &str) -> Result<Vec<u8>, String> {
    match line.strip_prefix("hex:") {
        Some(hex) => decode_hex(hex.trim()),
        None => Ok(line.as_bytes().to_vec()),
    }
}

/// Split a `<source> <payload>` line.
pub fn parse_tagged_line(line: &str) -> Result<(SourceTag, Vec<u8>), String> {
    let (tag, payload) = line
        .trim_start()
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("expected '<wrist|chest> <payload>', got '{line}'"))?;
    Ok((tag.parse()?, parse_payload(payload.trim_start())?))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{hex}'"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let s: String = pair.iter().collect();
            u8::from_str_radix(&s, 16).map_err(|_| format!("invalid hex byte '{s}'"))
        })
        .collect()
}
