//! Fixed limits shared by the acceptance filter, the converter and the scheduler.

use bytesize::ByteSize;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Hard per-file ceiling, enforced at acceptance and again before conversion.
pub const MAX_FILE_SIZE: u64 = 2 * GIB;

/// Jobs per chunk. The engine is cleared once between chunks.
pub const CHUNK_SIZE: usize = 2;

/// Share of the memory ceiling treated as a safe working set.
pub const MEMORY_SAFE_FRACTION: f64 = 0.8;

/// Ceilings reported below this are raised to it.
pub const MIN_MEMORY: u64 = 64 * MIB;

/// Assumed ceiling when the host does not report one.
pub const DEFAULT_MEMORY: u64 = 512 * MIB;

/// Files above this size always run the engine single-threaded.
pub const SERIAL_FILE_THRESHOLD: u64 = 50 * MIB;

/// Hosts below this ceiling always run the engine single-threaded.
pub const SERIAL_MEMORY_THRESHOLD: u64 = GIB;

/// Smallest buffer hint handed to the engine.
pub const MIN_BUFFER: u64 = MIB;

/// Engine's own default input probe size; the buffer hint never narrows it.
pub const MIN_PROBE_SIZE: u64 = 5_000_000;

pub fn human(bytes: u64) -> ByteSize {
    ByteSize::b(bytes)
}
