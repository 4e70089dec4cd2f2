/// Percent-encodes a byte slice for use as a query-string value.
///
/// Every byte is escaped as `%xx`. Trackers accept the always-escaped form
/// for binary parameters such as the infohash and the peer id, so there is
/// no unreserved-character fast path.
pub fn encode(data: &[u8]) -> String {
    let mut encoded = String::with_capacity(data.len() * 3);
    for byte in data {
        encoded.push('%');
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

/// Decodes a `%xx`-escaped string back into bytes.
///
/// Unescaped characters are taken literally. Returns `None` on a truncated
/// or non-hexadecimal escape.
pub fn decode(encoded: &str) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut chars = encoded.chars();

    while let Some(c) = chars.next() {
        if c == '%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let byte = u8::from_str_radix(&format!("{}{}", hi, lo), 16).ok()?;
            out.push(byte);
        } else {
            out.push(c as u8);
        }
    }
    Some(out)
}
