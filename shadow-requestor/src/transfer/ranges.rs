//! `offset:length` range lists used for partial files.

use super::TransferError;

/// One byte range of a partial file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Parse a comma-separated `offset:length` list.
///
/// Numbers are decimal or `0x`-prefixed hexadecimal. Empty text is an empty
/// list (the whole file). Any malformed entry fails the whole list.
pub fn parse(text: &str) -> Result<Vec<ByteRange>, TransferError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed
        .split(',')
        .map(|entry| {
            let malformed = || TransferError::MalformedRanges(text.to_string());
            let (offset, length) = entry.split_once(':').ok_or_else(malformed)?;
            let range = ByteRange {
                offset: parse_number(offset).ok_or_else(malformed)?,
                length: parse_number(length).ok_or_else(malformed)?,
            };
            range.end().ok_or_else(malformed)?;
            Ok(range)
        })
        .collect()
}

/// Format ranges back into list text.
pub fn format(ranges: &[ByteRange]) -> String {
    ranges
        .iter()
        .map(|r| format!("{}:{}", r.offset, r.length))
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() => u64::from_str_radix(hex, 16).ok(),
        Some(_) => None,
        None if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) => text.parse().ok(),
        None => None,
    }
}
