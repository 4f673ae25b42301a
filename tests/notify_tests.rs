//! Which waiting caller gets woken, and when: the window timer wakes the
//! caller that polled last, a dropped driver hands off to another caller,
//! and a settled batch wakes everyone still waiting on it.

use cooked_waker::{IntoWaker, Wake, WakeRef};
use dataloaders::{BatchResult, LoadFuture, Loader, LoaderOptions};
use futures::{future::poll_fn, FutureExt};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll, Waker},
    thread::sleep,
    time::Duration,
};

/// Raised when its waker is woken.
#[derive(Debug, Clone, Default, IntoWaker)]
struct Flag(Arc<AtomicBool>);

impl WakeRef for Flag {
    fn wake_by_ref(&self) {
        self.0.store(true, Ordering::SeqCst)
    }
}

impl Wake for Flag {}

/// A caller polled by hand, with its own waker.
struct Caller<Fut> {
    fut: Fut,
    flag: Flag,
    waker: Waker,
}

impl<Fut: Future + Unpin> Caller<Fut> {
    fn new(fut: Fut) -> Self {
        let flag = Flag::default();
        Caller {
            fut,
            waker: flag.clone().into_waker(),
            flag,
        }
    }

    fn poll(&mut self) -> Poll<Fut::Output> {
        self.flag.0.store(false, Ordering::SeqCst);
        self.fut.poll_unpin(&mut Context::from_waker(&self.waker))
    }
}

impl<Fut> Caller<Fut> {
    fn woken(&self) -> bool {
        self.flag.0.load(Ordering::SeqCst)
    }
}

/// Holds the batch function until the test opens it, then wakes whoever
/// polled the batch last.
#[derive(Default)]
struct Latch {
    state: Mutex<(bool, Option<Waker>)>,
}

impl Latch {
    fn open(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        if let Some(waker) = state.1.take() {
            waker.wake();
        }
    }

    async fn wait(&self) {
        poll_fn(|ctx| {
            let mut state = self.state.lock().unwrap();
            if state.0 {
                Poll::Ready(())
            } else {
                state.1 = Some(ctx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }
}

fn identity(keys: Vec<i32>) -> BatchResult<i32, ()> {
    Ok(keys.into_iter().map(Ok).collect())
}

/// A loader whose batch function waits on `latch`, counting its calls.
fn latched<'a>(
    latch: &'a Latch,
    calls: &'a AtomicUsize,
    options: LoaderOptions<i32>,
) -> Loader<
    i32,
    i32,
    (),
    impl Fn(Vec<i32>) -> futures::future::BoxFuture<'a, BatchResult<i32, ()>> + 'a,
> {
    Loader::with_options(
        move |keys: Vec<i32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                latch.wait().await;
                identity(keys)
            }
            .boxed()
        },
        options,
    )
}

fn woken<Fut>(callers: &[&Caller<Fut>]) -> Vec<bool> {
    callers.iter().map(|caller| caller.woken()).collect()
}

#[test]
fn window_timer_wakes_the_last_poller() {
    let latch = Latch::default();
    let calls = AtomicUsize::new(0);
    let loader = latched(
        &latch,
        &calls,
        LoaderOptions::new().with_window(Duration::from_millis(5)),
    );

    let mut first = Caller::new(loader.load(1));
    let mut second = Caller::new(loader.load(2));
    let mut third = Caller::new(loader.load(3));

    assert_eq!(first.poll(), Poll::Pending);
    assert_eq!(second.poll(), Poll::Pending);
    assert_eq!(third.poll(), Poll::Pending);
    assert_eq!(woken(&[&first, &second, &third]), [false, false, false]);

    sleep(Duration::from_millis(20));
    assert_eq!(woken(&[&first, &second, &third]), [false, false, true]);

    // Dispatches, then waits on the latch
    assert_eq!(third.poll(), Poll::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(woken(&[&first, &second, &third]), [false, false, false]);

    latch.open();
    assert!(third.woken());

    assert_eq!(third.poll(), Poll::Ready(Ok(3)));
    assert_eq!(woken(&[&first, &second]), [true, true]);

    assert_eq!(first.poll(), Poll::Ready(Ok(1)));
    assert_eq!(second.poll(), Poll::Ready(Ok(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn running_batch_hands_off_when_driver_drops() {
    let latch = Latch::default();
    let calls = AtomicUsize::new(0);
    let loader = latched(
        &latch,
        &calls,
        LoaderOptions::new().with_window(Duration::ZERO),
    );

    let mut first = Caller::new(loader.load(1));
    let mut second = Caller::new(loader.load(2));
    let mut third = Caller::new(loader.load(3));

    // first dispatches; the last caller to poll the running batch drives it
    assert_eq!(first.poll(), Poll::Pending);
    assert_eq!(second.poll(), Poll::Pending);
    assert_eq!(third.poll(), Poll::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(third);
    let handed_to: Vec<bool> = woken(&[&first, &second]);
    assert_eq!(handed_to.iter().filter(|&&woken| woken).count(), 1);

    // The latch still holds the dropped caller's waker; opening it wakes
    // nobody who is left, so the new driver has to be polled by hand.
    latch.open();
    let (mut driver, mut passenger) = if handed_to[0] {
        (first, second)
    } else {
        (second, first)
    };

    let expected = if handed_to[0] { (1, 2) } else { (2, 1) };
    assert_eq!(driver.poll(), Poll::Ready(Ok(expected.0)));
    assert!(passenger.woken());
    assert_eq!(passenger.poll(), Poll::Ready(Ok(expected.1)));
}

#[test]
fn passenger_drop_wakes_nobody() {
    let latch = Latch::default();
    let calls = AtomicUsize::new(0);
    let loader = latched(
        &latch,
        &calls,
        LoaderOptions::new().with_window(Duration::from_secs(60)),
    );

    let mut first = Caller::new(loader.load(1));
    let mut second = Caller::new(loader.load(2));
    let mut third = Caller::new(loader.load(3));

    assert_eq!(first.poll(), Poll::Pending);
    assert_eq!(second.poll(), Poll::Pending);
    assert_eq!(third.poll(), Poll::Pending);

    drop(first);
    drop(second);
    assert!(!third.woken());

    // The abandoned keys are still fetched
    loader.dispatch();
    assert!(third.woken());
    latch.open();
    assert_eq!(third.poll(), Poll::Ready(Ok(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!loader.clear(&4));
    assert!(loader.clear(&1));
}

#[test]
fn cache_joiner_is_woken_on_completion() {
    let latch = Latch::default();
    let calls = AtomicUsize::new(0);
    let loader = latched(
        &latch,
        &calls,
        LoaderOptions::new().with_window(Duration::ZERO),
    );

    let mut first: Caller<LoadFuture<_, _, _, _>> = Caller::new(loader.load(1));
    assert_eq!(first.poll(), Poll::Pending);

    // Same key while the batch is running: joins it through the cache
    let mut joiner = Caller::new(loader.load(1));
    assert_eq!(joiner.poll(), Poll::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // joiner polled last, so the latch wakes it
    latch.open();
    assert!(joiner.woken());
    assert!(!first.woken());

    assert_eq!(joiner.poll(), Poll::Ready(Ok(1)));
    assert!(first.woken());
    assert_eq!(first.poll(), Poll::Ready(Ok(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn dispatch_wakes_the_driver() {
    let latch = Latch::default();
    latch.open();
    let calls = AtomicUsize::new(0);
    let loader = latched(
        &latch,
        &calls,
        LoaderOptions::new().with_window(Duration::from_secs(60)),
    );

    let mut first = Caller::new(loader.load(1));
    let mut second = Caller::new(loader.load(2));

    assert_eq!(first.poll(), Poll::Pending);
    assert_eq!(second.poll(), Poll::Pending);

    loader.dispatch();
    assert_eq!(woken(&[&first, &second]), [false, true]);

    assert_eq!(second.poll(), Poll::Ready(Ok(2)));
    assert!(first.woken());
    assert_eq!(first.poll(), Poll::Ready(Ok(1)));
}
