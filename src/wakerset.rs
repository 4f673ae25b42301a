use std::{collections::HashMap, num::NonZeroUsize, task::Waker};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

/// The wakers of every caller waiting on one batch window.
///
/// Only one task needs to drive a window forward (poll its delay, then the
/// batch function's future); the rest just need to hear about the result.
/// The "driving waker" is the one that most recently polled the window. If
/// the driving caller goes away before the batch settles, another waiting
/// caller is woken to take its place, so a batch always has a path to
/// completion as long as anyone is still waiting on it.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driver: Option<Token>,

    // Tokens are an ever-increasing integer. A window lives for one batch,
    // so running out is not a concern.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            driver: None,
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Record `waker` as the driving waker. The first time a caller
    /// registers, a token is stored in `slot`; later polls by the same caller
    /// reuse it.
    pub(crate) fn register(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        let token = match *slot {
            Some(token) => token,
            None => {
                let token = Token(self.next_token);
                self.next_token = self.next_token.saturating_add(1);
                *slot = Some(token);
                token
            }
        };

        match self.wakers.get_mut(&token) {
            Some(existing) if existing.will_wake(waker) => {}
            Some(existing) => existing.clone_from(waker),
            None => {
                self.wakers.insert(token, waker.clone());
            }
        }

        self.driver = Some(token);
    }

    /// Wake the driving task, so that it notices the window was closed early.
    pub(crate) fn wake_driver(&self) {
        let driver = self.driver.and_then(|token| self.wakers.get(&token));
        if let Some(waker) = driver {
            waker.wake_by_ref();
        }
    }

    /// Remove a caller that is no longer interested. If it was driving the
    /// window (or nobody was), some other caller is made the driver and woken
    /// so that it can carry on.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);

        if self.driver == Some(token) || self.driver.is_none() {
            self.driver = None;
            if let Some((&next, waker)) = self.wakers.iter().next() {
                self.driver = Some(next);
                waker.wake_by_ref();
            }
        }
    }

    /// Wake everyone except `token`, which is about to collect its result
    /// directly.
    pub(crate) fn discard_wake_all(mut self, token: Option<Token>) {
        if let Some(token) = token {
            self.wakers.remove(&token);
        }

        self.wakers.into_values().for_each(Waker::wake);
    }

    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }
}
