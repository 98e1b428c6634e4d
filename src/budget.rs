//! Per-file memory budget for engine invocations.
//!
//! The budget is advisory. It only shapes the flags passed to the engine; the
//! scheduler itself never looks at it.

use serde::Serialize;
use strum::Display;
use tracing::debug;

use crate::limits::{
    DEFAULT_MEMORY, MEMORY_SAFE_FRACTION, MIN_BUFFER, MIN_MEMORY, SERIAL_FILE_THRESHOLD,
    SERIAL_MEMORY_THRESHOLD,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Parallelism {
    /// Let the engine pick its thread count.
    Auto,
    Serial,
}

impl Parallelism {
    /// Value for the engine's `-threads` flag.
    pub fn threads_flag(self) -> &'static str {
        match self {
            Parallelism::Auto => "0",
            Parallelism::Serial => "1",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MemoryBudget {
    pub parallelism: Parallelism,
    pub buffer_size: u64,
}

/// Total memory reported by the host, if it reports any.
pub fn host_memory_ceiling() -> Option<u64> {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    match system.total_memory() {
        0 => None,
        total => Some(total),
    }
}

/// Ceiling actually used for budgeting: the reported one, or the default, never below the floor.
pub fn effective_ceiling(reported: Option<u64>) -> u64 {
    reported.unwrap_or(DEFAULT_MEMORY).max(MIN_MEMORY)
}

pub fn safe_working_set(ceiling: u64) -> u64 {
    (ceiling as f64 * MEMORY_SAFE_FRACTION) as u64
}

pub fn estimate(file_size: u64, reported_ceiling: Option<u64>) -> MemoryBudget {
    let ceiling = effective_ceiling(reported_ceiling);
    let safe = safe_working_set(ceiling);
    let buffer_size = file_size.saturating_mul(2).max(MIN_BUFFER).min(safe);
    let parallelism = if file_size > SERIAL_FILE_THRESHOLD || ceiling < SERIAL_MEMORY_THRESHOLD {
        Parallelism::Serial
    } else {
        Parallelism::Auto
    };
    debug!(file_size, ceiling, buffer_size, %parallelism, "memory budget");
    MemoryBudget {
        parallelism,
        buffer_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{GIB, MIB};

    #[test]
    fn small_file_on_large_host_runs_threaded() {
        let budget = estimate(10 * MIB, Some(2 * GIB));
        assert_eq!(budget.parallelism, Parallelism::Auto);
        assert_eq!(budget.buffer_size, 20 * MIB);
        assert!(budget.buffer_size >= MIB);
        assert!(budget.buffer_size <= safe_working_set(2 * GIB));
    }

    #[test]
    fn large_file_is_always_serial() {
        for ceiling in [None, Some(128 * MIB), Some(2 * GIB), Some(64 * GIB)] {
            assert_eq!(estimate(100 * MIB, ceiling).parallelism, Parallelism::Serial);
        }
    }

    #[test]
    fn small_host_is_serial() {
        assert_eq!(estimate(MIB, Some(768 * MIB)).parallelism, Parallelism::Serial);
        // unreported ceiling falls back to 512 MiB
        assert_eq!(estimate(MIB, None).parallelism, Parallelism::Serial);
    }

    #[test]
    fn buffer_is_clamped_to_floor_and_working_set() {
        assert_eq!(estimate(0, Some(2 * GIB)).buffer_size, MIB);
        assert_eq!(estimate(10, None).buffer_size, MIB);

        let safe = safe_working_set(DEFAULT_MEMORY);
        assert_eq!(estimate(400 * MIB, None).buffer_size, safe);
    }

    #[test]
    fn ceiling_is_floored() {
        assert_eq!(effective_ceiling(Some(MIB)), MIN_MEMORY);
        assert_eq!(effective_ceiling(None), DEFAULT_MEMORY);
        assert_eq!(estimate(MIB, Some(MIB)).buffer_size, 2 * MIB);
    }

    #[test]
    fn threads_flag() {
        assert_eq!(Parallelism::Auto.threads_flag(), "0");
        assert_eq!(Parallelism::Serial.threads_flag(), "1");
    }
}
