//! Utility functions for converting between different data types.

use crate::{CaskError, CaskResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a memory limit string of the form `<digits><unit>` into bytes.
///
/// Recognized units (case-insensitive): `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`,
/// with the usual 1024-based multipliers. A bare number is taken as bytes.
///
/// ## Examples
///
/// ```
/// use cask::utils::parse_mem_limit;
///
/// assert_eq!(parse_mem_limit("64MB").unwrap(), 67_108_864);
/// assert_eq!(parse_mem_limit("512k").unwrap(), 524_288);
/// ```
pub fn parse_mem_limit(limit: &str) -> CaskResult<u64> {
    let limit = limit.trim().to_ascii_lowercase();
    let split = limit
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(limit.len());
    let (amount, unit) = limit.split_at(split);

    let amount: u64 = amount
        .parse()
        .map_err(|_| CaskError::InvalidMemoryLimit(limit.clone()))?;

    let multiplier: u64 = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return Err(CaskError::InvalidMemoryLimit(limit.clone())),
    };

    amount
        .checked_mul(multiplier)
        .ok_or(CaskError::InvalidMemoryLimit(limit))
}

/// Encodes a CPU percentage as a cgroup v2 `cpu.max` line.
///
/// The period is fixed at 100000 µs; the quota is `percent * 1000` µs, so 100
/// means one full CPU.
pub fn cpu_max_line(percent: u32) -> String {
    format!("{} 100000", percent * 1000)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mem_limit_units() {
        assert_eq!(parse_mem_limit("500").unwrap(), 500);
        assert_eq!(parse_mem_limit("500b").unwrap(), 500);
        assert_eq!(parse_mem_limit("1k").unwrap(), 1024);
        assert_eq!(parse_mem_limit("2kb").unwrap(), 2048);
        assert_eq!(parse_mem_limit("3m").unwrap(), 3 * 1024 * 1024);
        assert_eq!(parse_mem_limit("64MB").unwrap(), 67_108_864);
        assert_eq!(parse_mem_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_mem_limit("2gb").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_mem_limit_rejects_garbage() {
        assert!(parse_mem_limit("").is_err());
        assert!(parse_mem_limit("mb").is_err());
        assert!(parse_mem_limit("64xb").is_err());
        assert!(parse_mem_limit("sixty4mb").is_err());
        assert!(parse_mem_limit("64 mb potato").is_err());
    }

    #[test]
    fn test_parse_mem_limit_overflow() {
        assert!(parse_mem_limit("99999999999999999999gb").is_err());
        assert!(parse_mem_limit("18446744073709551615gb").is_err());
    }

    #[test]
    fn test_cpu_max_line() {
        assert_eq!(cpu_max_line(20), "20000 100000");
        assert_eq!(cpu_max_line(100), "100000 100000");
    }
}
