use std::{
    fmt::{self, Debug, Formatter},
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};

/// Normalizes a key before it is used for deduplication and caching. Return
/// `None` to reject the key outright.
pub type CacheKeyFn<K> = Arc<dyn Fn(&K) -> Option<K> + Send + Sync>;

/// Configuration for a [`Loader`][crate::Loader].
///
/// - `cache` controls whether results outlive the batch that produced them.
///   With the cache off, keys are still deduplicated within a single batch.
///   Only successful values are cached. Unlike the JavaScript `dataloader`,
///   a per-key error is not kept: the next load of that key fetches again
///   without needing a `clear` first.
/// - `max_batch_size` caps the number of distinct keys per batch. When a
///   batch reaches the cap it is dispatched immediately, regardless of the
///   window, and later keys go into a fresh batch.
/// - `window` is how long a batch collects keys after it is opened. A zero
///   window dispatches on the first poll, which still collects every key
///   requested before the first `.await`.
/// - `cache_key_fn` maps each key to the key used for deduplication and
///   caching. The batch function always sees the first key requested for
///   each cache key.
#[derive(Clone)]
pub struct LoaderOptions<K> {
    pub cache: bool,
    pub max_batch_size: Option<NonZeroUsize>,
    pub window: Duration,
    pub cache_key_fn: Option<CacheKeyFn<K>>,
}

impl<K> Default for LoaderOptions<K> {
    fn default() -> Self {
        Self {
            cache: true,
            max_batch_size: None,
            window: Duration::from_millis(1),
            cache_key_fn: None,
        }
    }
}

impl<K> Debug for LoaderOptions<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderOptions")
            .field("cache", &self.cache)
            .field("max_batch_size", &self.max_batch_size)
            .field("window", &self.window)
            .field(
                "cache_key_fn",
                &self.cache_key_fn.as_ref().map(|_| "<closure>"),
            )
            .finish()
    }
}

impl<K> LoaderOptions<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// A size of 0 is treated as unbounded.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = NonZeroUsize::new(max_batch_size);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_cache_key_fn(
        mut self,
        cache_key_fn: impl Fn(&K) -> Option<K> + Send + Sync + 'static,
    ) -> Self {
        self.cache_key_fn = Some(Arc::new(cache_key_fn));
        self
    }

    /// Compute the cache key for `key`, or `None` if it was rejected.
    pub(crate) fn cache_key(&self, key: &K) -> Option<K>
    where
        K: Clone,
    {
        match self.cache_key_fn {
            Some(ref normalize) => normalize(key),
            None => Some(key.clone()),
        }
    }

    /// True if a batch that has just reached `len` keys must be dispatched
    /// without waiting for its window.
    pub(crate) fn is_full(&self, len: usize) -> bool {
        match self.max_batch_size {
            Some(max) => len >= max.get(),
            None => false,
        }
    }
}
