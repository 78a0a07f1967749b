use std::path::PathBuf;

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum GcStrategy {
    /// Stop-the-world mark-sweep on the requesting thread.
    #[default]
    Serial,
    /// Work-stealing parallel mark, then sweep.
    Parallel,
    /// Allocation only; exhaustion is reported immediately.
    Epsilon,
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Heap budget in bytes.
    pub heap_size: usize,
    pub gc: GcStrategy,
    pub gc_threads: usize,
    /// Bytes reserved from the global budget per thread-local buffer refill.
    pub tlab_size: usize,
    /// Invocations plus backward branches before a method is queued for
    /// compilation. Zero disables compilation.
    pub jit_threshold: u32,
    pub jit_workers: usize,
    /// Methods with more bytecode than this stay interpreted.
    pub jit_max_method_size: usize,
    pub max_stack_depth: usize,
    pub thread_stack_size: usize,
    pub class_path: Vec<PathBuf>,
    pub native_library_path: Vec<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            heap_size: 64 << 20,
            gc: GcStrategy::Serial,
            gc_threads: std::thread::available_parallelism()
                .map(|n| n.get().min(8))
                .unwrap_or(2),
            tlab_size: 16 << 10,
            jit_threshold: 1000,
            jit_workers: 1,
            jit_max_method_size: 8000,
            max_stack_depth: 1024,
            thread_stack_size: 1 << 20,
            class_path: Vec::new(),
            native_library_path: Vec::new(),
        }
    }
}

impl VmConfig {
    pub fn jit_enabled(&self) -> bool {
        self.jit_threshold > 0 && self.jit_workers > 0
    }
}

/// Parses `4096`, `512k`, `64m` or `2g` into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((index, 'k' | 'K')) => (&s[..index], 10),
        Some((index, 'm' | 'M')) => (&s[..index], 20),
        Some((index, 'g' | 'G')) => (&s[..index], 30),
        Some(_) => (s, 0),
        None => return Err("empty size".to_string()),
    };
    let value: usize = digits
        .parse()
        .map_err(|e| format!("invalid size `{s}`: {e}"))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size `{s}` is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("512k").unwrap(), 512 << 10);
        assert_eq!(parse_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_size("2g").unwrap(), 2 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("m").is_err());
        assert!(parse_size("12q").is_err());
    }

    #[test]
    fn test_gc_strategy() {
        assert_eq!(GcStrategy::from_str("Parallel", true), Ok(GcStrategy::Parallel));
        assert_eq!(GcStrategy::from_str("epsilon", true), Ok(GcStrategy::Epsilon));
        assert!(GcStrategy::from_str("g1", true).is_err());
    }

    #[test]
    fn test_jit_enabled() {
        let mut config = VmConfig::default();
        assert!(config.jit_enabled());
        config.jit_threshold = 0;
        assert!(!config.jit_enabled());
    }
}
