// lowmem_guard - userspace low-memory killer

pub mod config;
pub mod daemon;
pub mod killer;
pub mod monitor;
pub mod notify;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use killer::{KillResult, Victim};
pub use monitor::MemInfo;
