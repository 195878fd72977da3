//! Kernel configuration constants.
//!
//! Centralizes tunables that would otherwise be scattered across modules.
//! Layout constants that user space also needs live in
//! `skerry_common::memlayout`.

/// Processor limits
pub mod cpu {
    /// Maximum number of CPUs the kernel brings up.
    pub const NCPU: usize = 8;
}

/// Environment limits
pub mod env {
    /// Size of the environment table.
    pub const NENV: usize = skerry_common::env::NENV;
}

/// Physical memory pool
pub mod memory {
    /// Number of physical page frames managed by the frame pool.
    pub const NFRAMES: usize = 4096;
}

/// Kernel monitor
pub mod monitor {
    /// Longest accepted command line (one VGA text line).
    pub const CMDBUF_SIZE: usize = 80;
    /// Maximum number of whitespace-separated arguments.
    pub const MAXARGS: usize = 16;
    /// Frames `backtrace` follows before giving up on a corrupt chain.
    pub const BACKTRACE_MAX_DEPTH: usize = 64;
    /// Prompt printed before each command.
    pub const PROMPT: &str = "K> ";
}

/// Logging
pub mod log {
    /// Level installed by `logger::init` when the caller has no preference.
    pub const DEFAULT_LEVEL: ::log::LevelFilter = ::log::LevelFilter::Info;
}
