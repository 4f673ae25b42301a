use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, Weak},
    task::{Context, Poll},
};

use futures::future::{join_all, JoinAll};
use futures_timer::Delay;
use tracing::{debug, trace, warn};

use crate::{
    batch::{lock, Batch, BatchFn, Settlement},
    cache::{Cached, KeyCache},
    data::{KeySet, Token as KeyToken},
    error::LoadError,
    options::LoaderOptions,
    wakerset::Token as WakerToken,
};

type SharedBatch<Key, Value, Error, Batcher> = Arc<Mutex<Batch<Key, Value, Error, Batcher>>>;

/// A caller's place in a batch: the batch, and the position of its key.
struct PendingKey<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    batch: SharedBatch<Key, Value, Error, Batcher>,
    token: KeyToken,
}

impl<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> Clone
    for PendingKey<Key, Value, Error, Batcher>
{
    fn clone(&self) -> Self {
        Self {
            batch: Arc::clone(&self.batch),
            token: self.token,
        }
    }
}

struct LoaderState<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    cache: KeyCache<Key, PendingKey<Key, Value, Error, Batcher>, Value>,

    // The window currently accepting keys, if any. This is weak so that a
    // window nobody is waiting on anymore can be freed; a window that has
    // been dispatched is detected by its state and replaced.
    window: Weak<Mutex<Batch<Key, Value, Error, Batcher>>>,
}

impl<Key: Eq + Hash, Value, Error, Batcher: BatchFn<Key, Value, Error>>
    LoaderState<Key, Value, Error, Batcher>
{
    fn settle(
        &mut self,
        batch: &SharedBatch<Key, Value, Error, Batcher>,
        settlement: Settlement<Key, Value>,
    ) {
        for (key, value) in settlement {
            self.cache
                .settle(key, value, |pending| Arc::ptr_eq(&pending.batch, batch));
        }
    }
}

/// A batching, deduplicating, caching key-value loader.
///
/// Each call to [`load`](Loader::load) registers a key and returns a
/// [`LoadFuture`]. Keys requested while a batch window is open are collected
/// together, deduplicated, and handed to the batch function in a single call
/// once the window closes. Each future then resolves with the result for its
/// own key.
///
/// A loader caches what it loads for as long as it lives, and is meant to be
/// created fresh for each request: it should not be shared between unrelated
/// requests.
pub struct Loader<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    batcher: Arc<Batcher>,
    options: LoaderOptions<Key>,
    state: Arc<Mutex<LoaderState<Key, Value, Error, Batcher>>>,
}

impl<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> Debug
    for Loader<Key, Value, Error, Batcher>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("batcher", &"<batch fn>")
            .field("options", &self.options)
            .finish()
    }
}

impl<Key, Value, Error, Batcher> Loader<Key, Value, Error, Batcher>
where
    Key: Eq + Hash + Clone,
    Value: Clone,
    Error: Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    /// Create a loader with the default options: caching on, no batch size
    /// limit, and a 1ms window.
    pub fn new(batcher: Batcher) -> Self {
        Self::with_options(batcher, LoaderOptions::default())
    }

    pub fn with_options(batcher: Batcher, options: LoaderOptions<Key>) -> Self {
        Self {
            batcher: Arc::new(batcher),
            options,
            state: Arc::new(Mutex::new(LoaderState {
                cache: KeyCache::new(),
                window: Weak::new(),
            })),
        }
    }

    pub fn options(&self) -> &LoaderOptions<Key> {
        &self.options
    }

    /// Load the value for a key.
    ///
    /// If the value is cached, the returned future is already complete. If
    /// the key is already part of a batch, the future shares that batch's
    /// result. Otherwise the key is added to the open batch window, opening
    /// one if needed. Nothing is fetched until one of the waiting futures is
    /// polled after the window closes.
    pub fn load(&self, key: Key) -> LoadFuture<Key, Value, Error, Batcher> {
        let cache_key = match self.options.cache_key(&key) {
            Some(cache_key) => cache_key,
            None => {
                warn!("rejected key: cache key function returned None");
                return LoadFuture::settled(Err(LoadError::InvalidKey));
            }
        };

        let mut state = lock(&self.state);

        if self.options.cache {
            match state.cache.get(&cache_key).cloned() {
                Some(Cached::Resolved(value)) => {
                    trace!("cache hit");
                    return LoadFuture::settled(Ok(value));
                }
                Some(Cached::Pending(pending)) => {
                    trace!("joining pending batch");
                    drop(state);
                    return self.waiting(pending);
                }
                None => {}
            }
        }

        let pending = self.enqueue(&mut state, key, cache_key.clone());

        if self.options.cache {
            state.cache.set(cache_key, Cached::Pending(pending.clone()));
        }

        drop(state);
        self.waiting(pending)
    }

    /// Load several keys at once. Each key goes through [`load`](Loader::load),
    /// so duplicates are fetched once and cached keys aren't fetched at all;
    /// the results are in the same order as `keys`.
    pub fn load_many(
        &self,
        keys: impl IntoIterator<Item = Key>,
    ) -> JoinAll<LoadFuture<Key, Value, Error, Batcher>> {
        join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Remove a key from the cache. A batch already running for it still
    /// completes for its callers, but the next `load` fetches again. Returns
    /// true if there was anything to remove.
    ///
    /// Failed loads are never cached, so a key whose last load failed has
    /// nothing to clear: retrying is just another `load`.
    pub fn clear(&self, key: &Key) -> bool {
        match self.options.cache_key(key) {
            Some(cache_key) => lock(&self.state).cache.clear(&cache_key),
            None => false,
        }
    }

    pub fn clear_all(&self) {
        let mut state = lock(&self.state);
        debug!(entries = state.cache.len(), "clearing loader cache");
        state.cache.clear_all();
    }

    /// Seed the cache with a value, so that loading `key` doesn't fetch it.
    /// An existing entry is left alone; use [`clear`](Loader::clear) first to
    /// replace it. Returns true if the value was stored. Always false when
    /// caching is disabled.
    pub fn prime(&self, key: Key, value: Value) -> bool {
        if !self.options.cache {
            return false;
        }

        match self.options.cache_key(&key) {
            Some(cache_key) => lock(&self.state)
                .cache
                .set_if_absent(cache_key, Cached::Resolved(value)),
            None => false,
        }
    }

    /// Close the open batch window, if there is one, without waiting for it
    /// to elapse. The batch is fetched the next time one of its callers is
    /// polled; keys loaded after this call go into a new window.
    pub fn dispatch(&self) {
        let mut state = lock(&self.state);
        if let Some(batch) = mem::take(&mut state.window).upgrade() {
            debug!("closing batch window early");
            lock(&batch).close();
        }
    }

    /// Add a key to the open window, or open a new one.
    fn enqueue(
        &self,
        state: &mut LoaderState<Key, Value, Error, Batcher>,
        key: Key,
        cache_key: Key,
    ) -> PendingKey<Key, Value, Error, Batcher> {
        if let Some(batch) = state.window.upgrade() {
            let mut guard = lock(&batch);
            if let Some(keys) = guard.keys_mut() {
                let token = keys.add_key(key, cache_key);
                let len = keys.len();
                trace!(keys = len, "joined open batch window");

                // If we've hit the key limit, dispatch right away and detach
                // the window so that later keys start a fresh one.
                if self.options.is_full(len) {
                    debug!(keys = len, "batch is full, dispatching early");
                    guard.close();
                    state.window = Weak::new();
                }

                drop(guard);
                return PendingKey { batch, token };
            }
        }

        let mut keys = KeySet::new();
        let token = keys.add_key(key, cache_key);
        let full = self.options.is_full(keys.len());

        let delay = if full || self.options.window.is_zero() {
            None
        } else {
            Some(Delay::new(self.options.window))
        };

        let batch = Arc::new(Mutex::new(Batch::new(
            keys,
            Arc::clone(&self.batcher),
            delay,
            self.options.cache,
        )));

        state.window = if full {
            Weak::new()
        } else {
            Arc::downgrade(&batch)
        };

        debug!("opened batch window");
        PendingKey { batch, token }
    }

    fn waiting(
        &self,
        pending: PendingKey<Key, Value, Error, Batcher>,
    ) -> LoadFuture<Key, Value, Error, Batcher> {
        LoadFuture {
            state: FutureState::Waiting(Waiting {
                pending,
                waker_token: None,
                loader: Arc::downgrade(&self.state),
            }),
        }
    }
}

struct Waiting<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    pending: PendingKey<Key, Value, Error, Batcher>,
    waker_token: Option<WakerToken>,
    loader: Weak<Mutex<LoaderState<Key, Value, Error, Batcher>>>,
}

enum FutureState<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    Settled(Result<Value, LoadError<Error>>),
    Waiting(Waiting<Key, Value, Error, Batcher>),
    Complete,
}

/// The future returned by [`Loader::load`]. Resolves to the value for one
/// key, or the reason it couldn't be loaded.
///
/// Polling any future waiting on a batch drives that batch forward; it is
/// not necessary to poll all of them, and dropping one doesn't cancel the
/// batch for the others.
pub struct LoadFuture<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    state: FutureState<Key, Value, Error, Batcher>,
}

impl<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> LoadFuture<Key, Value, Error, Batcher> {
    fn settled(result: Result<Value, LoadError<Error>>) -> Self {
        Self {
            state: FutureState::Settled(result),
        }
    }
}

impl<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> Debug
    for LoadFuture<Key, Value, Error, Batcher>
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            FutureState::Settled(..) => "Settled",
            FutureState::Waiting(..) => "Waiting",
            FutureState::Complete => "Complete",
        };
        f.debug_struct("LoadFuture").field("state", &state).finish()
    }
}

// Nothing in a LoadFuture is ever pinned: the batch function's future lives
// in a Box inside the shared batch.
impl<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> Unpin
    for LoadFuture<Key, Value, Error, Batcher>
{
}

impl<Key, Value, Error, Batcher> Future for LoadFuture<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    type Output = Result<Value, LoadError<Error>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        match mem::replace(&mut this.state, FutureState::Complete) {
            FutureState::Complete => panic!("Can't re-poll a completed LoadFuture"),
            FutureState::Settled(result) => Poll::Ready(result),
            FutureState::Waiting(mut waiting) => {
                // The batch lock is released at the end of this statement;
                // cache updates below take the loader lock, which must never
                // be acquired while holding a batch lock.
                let polled = lock(&waiting.pending.batch).poll_key(
                    waiting.pending.token,
                    &mut waiting.waker_token,
                    ctx,
                );

                match polled {
                    Poll::Pending => {
                        this.state = FutureState::Waiting(waiting);
                        Poll::Pending
                    }
                    Poll::Ready((result, settlement)) => {
                        if let Some(settlement) = settlement {
                            if let Some(loader) = waiting.loader.upgrade() {
                                lock(&loader).settle(&waiting.pending.batch, settlement);
                            }
                        }
                        Poll::Ready(result)
                    }
                }
            }
        }
    }
}

impl<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> Drop
    for LoadFuture<Key, Value, Error, Batcher>
{
    fn drop(&mut self) {
        // Only a future that has polled holds a waker token, and only those
        // can be driving the batch.
        if let FutureState::Waiting(ref mut waiting) = self.state {
            if let Some(waker_token) = waiting.waker_token.take() {
                lock(&waiting.pending.batch).abandon(waker_token);
            }
        }
    }
}
