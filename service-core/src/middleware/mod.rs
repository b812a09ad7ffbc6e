pub mod signature;
pub mod tracing;
