use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures::FutureExt;
use futures_timer::Delay;
use tracing::{debug, warn};

use crate::{
    data::{BatchResult, KeySet, Token as KeyToken, ValueSet},
    error::LoadError,
    wakerset::{Token as WakerToken, WakerSet},
};

/// The function that actually fetches data. It is given the distinct keys
/// requested during one batch window, in the order they were first
/// requested, and must return one result per key in the same order (or a
/// single error if the whole fetch failed).
///
/// Any `Fn(Vec<Key>) -> impl Future<Output = BatchResult<..>>` is a
/// `BatchFn`. Implement it by hand for a named type when the loader needs
/// to be stored in a struct.
pub trait BatchFn<Key, Value, Error> {
    type Fut: Future<Output = BatchResult<Value, Error>>;

    fn load(&self, keys: Vec<Key>) -> Self::Fut;
}

impl<Key, Value, Error, F, Fut> BatchFn<Key, Value, Error> for F
where
    F: Fn(Vec<Key>) -> Fut,
    Fut: Future<Output = BatchResult<Value, Error>>,
{
    type Fut = Fut;

    #[inline]
    fn load(&self, keys: Vec<Key>) -> Fut {
        self(keys)
    }
}

// A lock is never held across a poll of anything but the batch's own delay
// and future, and a panic there aborts (see Cargo.toml), so a poisoned lock
// still holds consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct AccumulatingState<Key, Batcher> {
    keys: KeySet<Key>,
    batcher: Arc<Batcher>,
    delay: Option<Delay>,
    wakers: WakerSet,
}

impl<Key: Debug, Batcher> Debug for AccumulatingState<Key, Batcher> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatingState")
            .field("keys", &self.keys)
            .field("batcher", &"<batch fn>")
            .field("delay", &self.delay)
            .field("wakers", &self.wakers)
            .finish()
    }
}

// Design notes:
//
// We only need one task to "drive" a running batch. However, there are two
// cases we need to handle:
// - If that task's future is dropped, a different task must continue driving
//   the batch
// - When the batch completes, we need to wake ALL the tasks
struct RunningState<Key, Fut> {
    fut: Pin<Box<Fut>>,
    cache_keys: Vec<Key>,
    wakers: WakerSet,
}

enum State<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    Accum(AccumulatingState<Key, Batcher>),
    Running(RunningState<Key, Batcher::Fut>),
    Done(ValueSet<Value, Error>),
}

/// Cache updates produced when a batch settles: the successful value for
/// each cache key, or `None` for keys whose load failed.
#[derive(Debug)]
pub(crate) struct Settlement<Key, Value> {
    entries: Vec<(Key, Option<Value>)>,
}

impl<Key, Value: Clone> Settlement<Key, Value> {
    fn new<Error>(cache_keys: Vec<Key>, values: &ValueSet<Value, Error>) -> Self {
        let mut settled: Vec<Option<Value>> = cache_keys.iter().map(|_| None).collect();
        for (index, value) in values.successes() {
            settled[index] = Some(value.clone());
        }

        Self {
            entries: cache_keys.into_iter().zip(settled).collect(),
        }
    }
}

impl<Key, Value> IntoIterator for Settlement<Key, Value> {
    type Item = (Key, Option<Value>);
    type IntoIter = std::vec::IntoIter<(Key, Option<Value>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// One batch window: the keys it collected, then the running batch
/// function, then the settled results. Shared by every caller waiting on it.
pub(crate) struct Batch<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> {
    state: State<Key, Value, Error, Batcher>,
    caching: bool,
}

impl<Key, Value, Error, Batcher> Debug for Batch<Key, Value, Error, Batcher>
where
    Key: Debug,
    Batcher: BatchFn<Key, Value, Error>,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Batch");
        match self.state {
            State::Accum(ref state) => debug.field("state", state),
            State::Running(ref state) => debug
                .field("state", &"Running")
                .field("keys", &state.cache_keys),
            State::Done(..) => debug.field("state", &"Done"),
        };
        debug.field("caching", &self.caching).finish()
    }
}

impl<Key, Value, Error, Batcher: BatchFn<Key, Value, Error>> Batch<Key, Value, Error, Batcher> {
    /// Open a new window holding `keys`. With no delay, the window is
    /// dispatched the first time any of its callers is polled.
    pub(crate) fn new(
        keys: KeySet<Key>,
        batcher: Arc<Batcher>,
        delay: Option<Delay>,
        caching: bool,
    ) -> Self {
        Self {
            state: State::Accum(AccumulatingState {
                keys,
                batcher,
                delay,
                wakers: WakerSet::default(),
            }),
            caching,
        }
    }

    /// The key set, if this window is still collecting keys.
    pub(crate) fn keys_mut(&mut self) -> Option<&mut KeySet<Key>> {
        match self.state {
            State::Accum(ref mut state) => Some(&mut state.keys),
            _ => None,
        }
    }

    /// Stop waiting for the window to elapse; the next poll dispatches the
    /// batch.
    pub(crate) fn close(&mut self) {
        if let State::Accum(ref mut state) = self.state {
            state.delay = None;
            state.wakers.wake_driver();
        }
    }

    /// A caller stopped waiting. If it was driving the batch, another caller
    /// is woken to take over. Leaving doesn't cancel anything: the key stays
    /// in the batch, and the batch runs to completion for everyone else.
    pub(crate) fn abandon(&mut self, waker_token: WakerToken) {
        match self.state {
            State::Accum(ref mut state) => state.wakers.discard_and_wake(waker_token),
            State::Running(ref mut state) => state.wakers.discard_and_wake(waker_token),
            State::Done(..) => {}
        }
    }
}

impl<Key, Value, Error, Batcher> Batch<Key, Value, Error, Batcher>
where
    Key: Eq + Hash,
    Value: Clone,
    Error: Clone,
    Batcher: BatchFn<Key, Value, Error>,
{
    /// Drive this batch on behalf of the caller holding `key_token`. Once the
    /// batch has settled, returns that caller's result. The call that
    /// actually settles the batch also gets the cache updates, which must be
    /// applied by the caller after releasing this batch's lock.
    #[allow(clippy::type_complexity)]
    pub(crate) fn poll_key(
        &mut self,
        key_token: KeyToken,
        waker_token: &mut Option<WakerToken>,
        ctx: &mut Context<'_>,
    ) -> Poll<(
        Result<Value, LoadError<Error>>,
        Option<Settlement<Key, Value>>,
    )> {
        if let State::Accum(ref mut state) = self.state {
            if let Some(ref mut delay) = state.delay {
                if delay.poll_unpin(ctx).is_pending() {
                    // This caller is now the one the delay will wake.
                    state.wakers.register(waker_token, ctx.waker());
                    return Poll::Pending;
                }
            }

            // Window has elapsed (or was closed). Transition to Running.
            let callers = state.keys.callers();
            let (keys, cache_keys) = state.keys.take();
            let wakers = mem::take(&mut state.wakers);

            debug!(
                keys = keys.len(),
                callers,
                waiting = wakers.len(),
                "dispatching batch"
            );

            let fut = Box::pin(state.batcher.load(keys));

            self.state = State::Running(RunningState {
                fut,
                cache_keys,
                wakers,
            });
        }

        let mut settlement = None;

        if let State::Running(ref mut state) = self.state {
            let result = match state.fut.as_mut().poll(ctx) {
                Poll::Pending => {
                    state.wakers.register(waker_token, ctx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(result) => result,
            };

            let cache_keys = mem::take(&mut state.cache_keys);
            let values = ValueSet::from_batch(cache_keys.len(), result);

            if let ValueSet::Failed(LoadError::Batch(..)) = values {
                warn!(keys = cache_keys.len(), "batch function failed");
            }
            debug!(
                keys = cache_keys.len(),
                failed = values.is_failed(),
                "batch settled"
            );

            // We're about to take our own result, so only the others need
            // waking.
            mem::take(&mut state.wakers).discard_wake_all(waker_token.take());

            if self.caching {
                settlement = Some(Settlement::new(cache_keys, &values));
            }

            self.state = State::Done(values);
        }

        match self.state {
            State::Done(ref values) => Poll::Ready((values.get(key_token), settlement)),
            _ => unreachable!("batch window contained invalid state"),
        }
    }
}
