pub mod aggregator;
pub mod analyzer;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod events;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod validate;
