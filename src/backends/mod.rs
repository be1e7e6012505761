/// Node pool and shared cache implementations
pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::MemoryPool;
pub use postgres::PgPool;
pub use redis::RedisCache;
