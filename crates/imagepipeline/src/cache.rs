//! In-memory cache for encoded images.

use std::sync::Arc;

use moka::sync::Cache;

use crate::image::EncodedImage;

/// Read/write interface the cache stage goes through. Values are handed out
/// by clone; for [`EncodedImage`] that is a refcount bump on shared bytes.
pub trait MemoryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<EncodedImage>;
    fn put(&self, key: String, image: EncodedImage);
    fn remove(&self, key: &str);
}

/// Size-bounded cache where the weight of an entry is its encoded byte size.
pub struct EncodedMemoryCache {
    cache: Cache<String, EncodedImage>,
}

impl EncodedMemoryCache {
    pub fn new(max_size_bytes: u64) -> EncodedMemoryCache {
        let cache = Cache::builder()
            .max_capacity(max_size_bytes)
            .weigher(|_key: &String, image: &EncodedImage| {
                u32::try_from(image.size()).unwrap_or(u32::MAX)
            })
            .build();
        EncodedMemoryCache { cache }
    }
}

impl MemoryCache for EncodedMemoryCache {
    fn get(&self, key: &str) -> Option<EncodedImage> {
        self.cache.get(key)
    }

    fn put(&self, key: String, image: EncodedImage) {
        self.cache.insert(key, image);
    }

    fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }
}

/// Shared cache handle as the pipeline wires it.
pub type SharedMemoryCache = Arc<dyn MemoryCache>;
