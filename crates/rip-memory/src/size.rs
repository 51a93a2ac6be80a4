use thiserror::Error;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid byte size `{input}`: expected an integer with an optional unit (B, K, KB, KiB, M, MB, MiB, G, GB, GiB)")]
pub struct ParseByteSizeError {
    input: String,
}

/// Parses human byte sizes such as `512`, `64K`, `4MiB` or `1 GB`.
///
/// Units are binary regardless of spelling: `1KB == 1KiB == 1024`.
pub fn parse_byte_size(input: &str) -> Result<u64, ParseByteSizeError> {
    let err = || ParseByteSizeError {
        input: input.to_string(),
    };

    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(err());
    }
    let value: u64 = digits.parse().map_err(|_| err())?;

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KB,
        "m" | "mb" | "mib" => MB,
        "g" | "gb" | "gib" => GB,
        _ => return Err(err()),
    };

    value.checked_mul(multiplier).ok_or_else(err)
}
