pub mod manager;

// Re-export common types
pub use manager::{ProxyRotator, ProxyEntry, ProxyState, PoolExhausted};
