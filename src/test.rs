#![cfg(test)]

use core::cell::Cell;
use std::time::Duration;

use futures::{executor, FutureExt};

use crate::{BatchResult, Loader, LoaderOptions};

fn zero_window<Key>() -> LoaderOptions<Key> {
    LoaderOptions::new().with_window(Duration::ZERO)
}

async fn stringify(keys: Vec<usize>) -> BatchResult<String, ()> {
    Ok(keys.into_iter().map(|key| Ok(key.to_string())).collect())
}

fn call_counter<'a, T, R>(
    counter: &'a Cell<usize>,
    function: impl Fn(T) -> R + 'a,
) -> impl Fn(T) -> R + 'a {
    move |argument| {
        counter.set(counter.get() + 1);
        function(argument)
    }
}

#[test]
fn simple_test() {
    let counter = Cell::new(0);
    let f = call_counter(&counter, stringify);

    let loader = Loader::with_options(&f, zero_window());

    let fut1 = loader.load(10);
    let fut2 = loader.load(20);

    let res1 = executor::block_on(fut1);
    let res2 = executor::block_on(fut2);

    assert_eq!(res1.unwrap(), "10");
    assert_eq!(res2.unwrap(), "20");
    assert_eq!(counter.get(), 1);
}

#[test]
fn settled_future_is_ready_immediately() {
    let counter = Cell::new(0);
    let f = call_counter(&counter, stringify);

    let loader = Loader::with_options(&f, zero_window());
    assert_eq!(executor::block_on(loader.load(1)).unwrap(), "1");

    // Cached: ready on the first poll, no batch involved.
    let res = loader.load(1).now_or_never();
    assert_eq!(res, Some(Ok(String::from("1"))));
    assert_eq!(counter.get(), 1);
}

/// A batch that settles after its key was cleared and reloaded must not
/// overwrite the cache entry belonging to the newer batch.
#[test]
fn stale_batch_does_not_overwrite_newer_entry() {
    let calls = Cell::new(0);
    let numbered = |keys: Vec<usize>| {
        calls.set(calls.get() + 1);
        let call = calls.get();
        async move {
            let values: Vec<Result<String, ()>> = keys
                .into_iter()
                .map(|key| Ok(format!("{}#{}", key, call)))
                .collect();
            Ok::<_, ()>(values)
        }
    };

    let loader = Loader::with_options(&numbered, zero_window());

    let first = loader.load(1);
    loader.dispatch();
    assert!(loader.clear(&1));
    let second = loader.load(1);

    assert_eq!(executor::block_on(first).unwrap(), "1#1");

    // The entry still points at the second batch, so this joins it.
    let third = loader.load(1);
    assert_eq!(executor::block_on(third).unwrap(), "1#2");
    assert_eq!(executor::block_on(second).unwrap(), "1#2");
    assert_eq!(calls.get(), 2);

    assert_eq!(executor::block_on(loader.load(1)).unwrap(), "1#2");
    assert_eq!(calls.get(), 2);
}
