//! Resource limits for sandboxed agent execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits applied to one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard wall-clock limit in seconds.
    pub timeout_seconds: u64,
    /// Memory limit in Docker notation (e.g. "256m", "1g").
    pub memory: String,
    /// CPU cores available (e.g. 0.5, 1.0, 2.0).
    pub cpus: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            memory: "256m".to_string(),
            cpus: 0.5,
        }
    }
}

impl ResourceLimits {
    /// Creates new resource limits.
    pub fn new(timeout_seconds: u64, memory: impl Into<String>, cpus: f64) -> Self {
        Self {
            timeout_seconds,
            memory: memory.into(),
            cpus,
        }
    }

    /// Sets the timeout.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Returns the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Parses the memory limit into bytes.
    ///
    /// Accepts a plain byte count or a number suffixed with `b`, `k`, `m` or
    /// `g` (optionally followed by `b`, case-insensitive).
    pub fn memory_bytes(&self) -> Result<i64, String> {
        parse_memory(&self.memory)
    }

    /// Returns the CPU limit in nano-CPUs, as Docker expects it.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

fn parse_memory(raw: &str) -> Result<i64, String> {
    let lowered = raw.trim().to_ascii_lowercase();
    let value = lowered
        .strip_suffix('b')
        .filter(|v| !v.is_empty())
        .unwrap_or(lowered.as_str());

    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1024_i64),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (value, 1),
        _ => return Err(format!("invalid memory limit '{raw}'")),
    };

    let amount: i64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory limit '{raw}'"))?;
    if amount <= 0 {
        return Err(format!("memory limit must be positive, got '{raw}'"));
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory limit '{raw}' overflows"))
}
