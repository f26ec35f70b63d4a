// Platform collaborators: file loading and a monotonic clock

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Instant;

/// Read a whole file (shader bytecode, model blobs)
pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Monotonic tick source; seconds = ticks / frequency
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub fn frequency(&self) -> u64 {
        1_000_000_000
    }

    pub fn seconds(&self) -> f64 {
        self.now() as f64 / self.frequency() as f64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert_eq!(clock.frequency(), 1_000_000_000);
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = load_file("does/not/exist.spv").unwrap_err();
        assert!(format!("{err:#}").contains("does/not/exist.spv"));
    }
}
