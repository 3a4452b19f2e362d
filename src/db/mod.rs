pub mod connection;
pub mod engine_pool;
pub mod executor;
pub mod normalize;
pub mod schema_store;
