//! These tests ensure that dropped futures correctly update the shared state
use cooked_waker::{IntoWaker, Wake, WakeRef};
use dataloaders::{BatchResult, Loader, LoaderOptions};
use futures::{executor, FutureExt};
use std::{
    future::Future,
    hash::Hash,
    pin::Pin,
    rc::Rc,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// Testing async function: put a copy of each key in an Rc in the result.
/// This lets us count how many places are holding on to each value.
async fn put_keys_in_rc<T: Copy + Eq + Hash>(keys: Vec<T>) -> BatchResult<Rc<T>, ()> {
    Ok(keys.into_iter().map(|key| Ok(Rc::new(key))).collect())
}

fn identity(keys: Vec<i32>) -> BatchResult<i32, ()> {
    Ok(keys.into_iter().map(Ok).collect())
}

/// This test establishes a baseline behavior for our clone counters
#[test]
fn test_simple_drop_after_resolution() {
    let loader = Loader::with_options(
        put_keys_in_rc,
        LoaderOptions::new()
            .with_window(Duration::ZERO)
            .with_cache(false),
    );

    let fut1 = loader.load(1);
    let fut2 = loader.load(1);
    let fut3 = loader.load(1);
    let fut4 = loader.load(1);

    let res1 = executor::block_on(fut1).unwrap();

    // At this point, the shared result and our local fut1 result should both
    // have an Rc
    assert_eq!(Rc::strong_count(&res1), 2);

    // Resolving fut2 simply clones the underlying Rc
    let res2 = executor::block_on(fut2).unwrap();
    assert_eq!(Rc::strong_count(&res2), 3);

    // Dropping this future shouldn't change anything
    drop(fut3);
    assert_eq!(Rc::strong_count(&res1), 3);

    // However, dropping our last remaining handle to the state should cause
    // the shared state to be dropped
    drop(fut4);
    assert_eq!(Rc::strong_count(&res1), 2);
}

/// With caching on, the loader's cache keeps its own copy of the value, which
/// outlives the batch.
#[test]
fn test_cache_holds_value_after_batch_dropped() {
    let loader = Loader::with_options(
        put_keys_in_rc,
        LoaderOptions::new().with_window(Duration::ZERO),
    );

    let fut1 = loader.load(1);
    let fut2 = loader.load(1);

    let res1 = executor::block_on(fut1).unwrap();

    // The batch's result, the cache entry, and ours
    assert_eq!(Rc::strong_count(&res1), 3);

    drop(fut2);
    assert_eq!(Rc::strong_count(&res1), 2);

    let res2 = executor::block_on(loader.load(1)).unwrap();
    assert!(Rc::ptr_eq(&res1, &res2));

    loader.clear_all();
    assert_eq!(Rc::strong_count(&res1), 2);
}

#[test]
fn test_drop_during_delay() {
    // Abandoned keys stay in the batch: dropping a future never cancels
    // anything for the remaining callers.
    let calls = Mutex::new(Vec::new());
    let loader = Loader::with_options(
        |keys: Vec<i32>| {
            calls.lock().unwrap().push(keys.clone());
            async move { identity(keys) }
        },
        LoaderOptions::new().with_window(Duration::from_millis(10)),
    );

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let fut11 = loader.load(1);
    let fut2 = loader.load(2);
    let fut3 = loader.load(3);

    // This poll initiates the delay. We'll drop futures in this phase, then
    // confirm that the remaining futures still resolve.
    let poll = Pin::new(&mut fut1).poll(&mut ctx);
    assert_eq!(poll, Poll::Pending);

    drop(fut11);
    drop(fut3);

    let result: i32 = executor::block_on(fut1).unwrap();
    assert_eq!(result, 1);

    let result: i32 = executor::block_on(fut2).unwrap();
    assert_eq!(result, 2);

    assert_eq!(*calls.lock().unwrap(), [vec![1, 2, 3]]);

    // 3 was fetched for nobody, but it's cached now
    assert_eq!(executor::block_on(loader.load(3)).unwrap(), 3);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

/// A future that stays pending until its gate is opened.
struct Gate<'a> {
    open: &'a Mutex<bool>,
}

impl Future for Gate<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if *self.open.lock().unwrap() {
            Poll::Ready(())
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[test]
fn test_drop_while_running() {
    let open = Mutex::new(false);
    let open_ref = &open;

    let loader = Loader::with_options(
        move |keys: Vec<i32>| async move {
            Gate { open: open_ref }.await;
            identity(keys.into_iter().map(|key| key * 10).collect())
        },
        LoaderOptions::new().with_window(Duration::ZERO),
    );

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let mut fut2 = loader.load(2);

    // fut1 dispatches the batch, then fut2 takes over driving it
    assert_eq!(fut1.poll_unpin(&mut ctx), Poll::Pending);
    assert_eq!(fut2.poll_unpin(&mut ctx), Poll::Pending);
    drop(fut1);

    // A key that was already in flight joins the running batch
    let mut fut11 = loader.load(1);
    assert_eq!(fut11.poll_unpin(&mut ctx), Poll::Pending);

    *open.lock().unwrap() = true;

    assert_eq!(fut2.poll_unpin(&mut ctx), Poll::Ready(Ok(20)));
    assert_eq!(fut11.poll_unpin(&mut ctx), Poll::Ready(Ok(10)));
}
