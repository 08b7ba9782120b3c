//! Size parsing for `MEMORY` and `DISK_SIZE`.
//!
//! Both accept an integer with an optional, case-insensitive `M`, `MB`, `G`
//! or `GB` suffix. Memory normalises to MiB (bare numbers are MiB); disk
//! normalises to GiB (bare numbers are GiB, MiB values round down).

const MIB_PER_GIB: u32 = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SizeUnit {
    Mebibytes,
    Gibibytes,
}

fn split_size(raw: &str) -> Result<(u32, Option<SizeUnit>), String> {
    let value = raw.trim().to_ascii_uppercase();
    let digits_end = value
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    if digits.is_empty() {
        return Err(format!("'{raw}' is not a size (expected e.g. 2048, 512M or 4G)"));
    }

    let unit = match suffix {
        "" => None,
        "M" | "MB" => Some(SizeUnit::Mebibytes),
        "G" | "GB" => Some(SizeUnit::Gibibytes),
        other => return Err(format!("unknown size unit '{other}' in '{raw}'")),
    };

    let amount = digits
        .parse::<u32>()
        .map_err(|_| format!("'{raw}' is too large"))?;
    Ok((amount, unit))
}

/// Parses a memory size into MiB.
pub(super) fn parse_memory_mb(raw: &str) -> Result<u32, String> {
    match split_size(raw)? {
        (amount, None | Some(SizeUnit::Mebibytes)) => Ok(amount),
        (amount, Some(SizeUnit::Gibibytes)) => amount
            .checked_mul(MIB_PER_GIB)
            .ok_or_else(|| format!("'{raw}' is too large")),
    }
}

/// Parses a disk size into GiB.
pub(super) fn parse_disk_gb(raw: &str) -> Result<u32, String> {
    match split_size(raw)? {
        (amount, None | Some(SizeUnit::Gibibytes)) => Ok(amount),
        (amount, Some(SizeUnit::Mebibytes)) => amount
            .checked_div(MIB_PER_GIB)
            .ok_or_else(|| format!("'{raw}' cannot be converted")),
    }
}
