// src/container/limits.rs

//! Resource limit parsing
//!
//! Limits come from the command line or config file as strings. Sizes take
//! an optional `G`, `M` or `K` suffix (powers of 1024); the word `max`
//! leaves a limit unset. CPU is a percentage of one host and is clamped to
//! `1..=100`.

use crate::error::{Error, Result};
use std::fmt;

/// Limits applied to every process of a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    pub memory_max: Option<u64>,
    /// CPU share in percent of one host
    pub cpu_percent: Option<u8>,
    /// Maximum number of live processes
    pub process_count: Option<u64>,
}

impl ResourceLimits {
    /// Parse the three limits; `None` or `"max"` leaves a limit unset
    pub fn parse(
        memory_max: Option<&str>,
        cpu_percent: Option<&str>,
        process_count: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            memory_max: memory_max.map(parse_size).transpose()?.flatten(),
            cpu_percent: cpu_percent.map(parse_cpu_percent).transpose()?.flatten(),
            process_count: process_count.map(parse_count).transpose()?.flatten(),
        })
    }

    pub fn is_unlimited(&self) -> bool {
        self.memory_max.is_none() && self.cpu_percent.is_none() && self.process_count.is_none()
    }
}

impl fmt::Display for ResourceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn or_max<T: fmt::Display>(v: Option<T>) -> String {
            v.map(|v| v.to_string()).unwrap_or_else(|| "max".to_string())
        }
        write!(
            f,
            "memory={} cpu={}% pids={}",
            or_max(self.memory_max),
            or_max(self.cpu_percent),
            or_max(self.process_count)
        )
    }
}

fn invalid(value: &str, reason: &str) -> Error {
    Error::InvalidLimit {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn is_max(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("max")
}

/// Parse a byte size such as `512M` or `2G`
pub fn parse_size(value: &str) -> Result<Option<u64>> {
    if is_max(value) {
        return Ok(None);
    }
    let text = value.trim();
    let (digits, multiplier) = match text.chars().last() {
        Some('G' | 'g') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        Some('M' | 'm') => (&text[..text.len() - 1], 1024 * 1024),
        Some('K' | 'k') => (&text[..text.len() - 1], 1024),
        Some(_) => (text, 1),
        None => return Err(invalid(value, "empty size")),
    };
    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| invalid(value, "expected a number with an optional G, M or K suffix"))?;
    number
        .checked_mul(multiplier)
        .map(Some)
        .ok_or_else(|| invalid(value, "size overflows 64 bits"))
}

/// Parse a CPU percentage, clamping to `1..=100`
pub fn parse_cpu_percent(value: &str) -> Result<Option<u8>> {
    if is_max(value) {
        return Ok(None);
    }
    let text = value.trim().trim_end_matches('%');
    let number: i64 = text
        .parse()
        .map_err(|_| invalid(value, "expected a percentage"))?;
    Ok(Some(number.clamp(1, 100) as u8))
}

pub fn parse_count(value: &str) -> Result<Option<u64>> {
    if is_max(value) {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| invalid(value, "expected a process count"))
}
