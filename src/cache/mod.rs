pub mod keys;
pub mod result_cache;

pub use self::keys::CacheKeys;
pub use self::result_cache::{CachePayload, CacheStats, ResultCache, TtlClass};
