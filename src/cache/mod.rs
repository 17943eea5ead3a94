pub mod lru;
pub mod store;

pub use lru::LruCacheManager;
pub use store::{ArrayBlob, CacheValue, PsfCacheStore};
