//! Data structures for passing keys into a batch function and distributing
//! its results back out, plus helpers for shaping a batch function's result.

use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;
use std::mem;

use tracing::error;

use crate::error::LoadError;

/// The result of a batch function: either one result per key, positionally
/// aligned with the keys it was given, or a single error for the whole batch.
pub type BatchResult<Value, Error> = Result<Vec<Result<Value, Error>>, Error>;

/// A position in a batch. Every caller waiting on the same key in the same
/// batch holds a token with the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(usize);

/// The distinct keys collected by a single batch window, in first-seen order.
#[derive(Debug)]
pub(crate) struct KeySet<Key> {
    // The key handed to the batch function is the first one requested for a
    // given cache key; the cache keys are kept alongside so that results can
    // be written back to the cache once the batch settles.
    keys: Vec<Key>,
    cache_keys: Vec<Key>,
    tokens: HashMap<Key, Token>,

    // Total number of requests, duplicates included. Only used for
    // diagnostics.
    callers: usize,
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            cache_keys: Vec::new(),
            tokens: HashMap::new(),
            callers: 0,
        }
    }

    /// Add a key to this KeySet, and return the token associated with its
    /// cache key. If the cache key was already present, the existing token is
    /// returned and `key` is discarded.
    pub(crate) fn add_key(&mut self, key: Key, cache_key: Key) -> Token {
        self.callers += 1;

        match self.tokens.entry(cache_key) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let token = Token(self.keys.len());
                self.cache_keys.push(entry.key().clone());
                self.keys.push(key);
                entry.insert(token);
                token
            }
        }
    }
}

impl<Key> KeySet<Key> {
    /// Number of distinct keys.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub(crate) fn callers(&self) -> usize {
        self.callers
    }

    /// Take the keyset out of this particular &mut self instance, leaving an
    /// empty set behind. Returns the keys for the batch function and the
    /// matching cache keys, both in first-seen order.
    pub(crate) fn take(&mut self) -> (Vec<Key>, Vec<Key>) {
        self.tokens.clear();
        self.callers = 0;
        (mem::take(&mut self.keys), mem::take(&mut self.cache_keys))
    }
}

/// The settled result of a batch, ready to be handed out to its callers.
#[derive(Debug)]
pub(crate) enum ValueSet<Value, Error> {
    Values(Vec<Result<Value, Error>>),
    Failed(LoadError<Error>),
}

impl<Value, Error> ValueSet<Value, Error> {
    /// Validate the output of a batch function that was given `expected`
    /// keys.
    pub(crate) fn from_batch(expected: usize, result: BatchResult<Value, Error>) -> Self {
        match result {
            Err(err) => ValueSet::Failed(LoadError::Batch(err)),
            Ok(values) if values.len() != expected => {
                error!(
                    expected,
                    actual = values.len(),
                    "batch function returned the wrong number of results"
                );
                ValueSet::Failed(LoadError::ContractViolation {
                    expected,
                    actual: values.len(),
                })
            }
            Ok(values) => ValueSet::Values(values),
        }
    }

    /// The successful value at each position, for writing into the cache.
    /// Empty if the batch failed as a whole.
    pub(crate) fn successes(&self) -> impl Iterator<Item = (usize, &Value)> {
        let values = match self {
            ValueSet::Values(values) => values.as_slice(),
            ValueSet::Failed(..) => &[],
        };

        values
            .iter()
            .enumerate()
            .filter_map(|(index, result)| result.as_ref().ok().map(|value| (index, value)))
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(self, ValueSet::Failed(..))
    }
}

impl<Value: Clone, Error: Clone> ValueSet<Value, Error> {
    /// Get a copy of the result for a token.
    pub(crate) fn get(&self, token: Token) -> Result<Value, LoadError<Error>> {
        match self {
            ValueSet::Failed(err) => Err(err.clone()),
            ValueSet::Values(values) => match values.get(token.0) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(err)) => Err(LoadError::Key(err.clone())),
                // Tokens are only ever created for positions in the
                // dispatched key list, and the length was validated.
                None => Err(LoadError::ContractViolation {
                    expected: token.0 + 1,
                    actual: values.len(),
                }),
            },
        }
    }
}

/// Types that know which key they were loaded by.
pub trait KeyedEntry<Key: ?Sized> {
    fn key(&self) -> &Key;
}

/// Arrange `rows`, which may be in any order and may be missing keys, into a
/// result aligned with `keys`. The first row for each key is used; keys with
/// no row get the error produced by `missing`.
///
/// This is the usual shape of a batch function that runs a single
/// `WHERE id IN (...)` style lookup. The keys given to a batch function are
/// always distinct; if `keys` does contain duplicates, only the first
/// occurrence receives the row.
pub fn align_by_key<Key, Value, Error>(
    keys: &[Key],
    rows: impl IntoIterator<Item = Value>,
    mut missing: impl FnMut(&Key) -> Error,
) -> Vec<Result<Value, Error>>
where
    Key: Eq + Hash,
    Value: KeyedEntry<Key>,
{
    let positions = first_positions(keys);

    let mut slots: Vec<Option<Value>> = keys.iter().map(|_| None).collect();
    for row in rows {
        let index = positions.get(row.key()).copied();
        if let Some(index) = index {
            if slots[index].is_none() {
                slots[index] = Some(row);
            }
        }
    }

    keys.iter()
        .zip(slots)
        .map(|(key, slot)| slot.ok_or_else(|| missing(key)))
        .collect()
}

/// Group `rows` into one collection per key, preserving row order. Every key
/// gets an entry, empty if no row matched. Used for one-to-many lookups
/// through a join table, where a single fetch returns the rows for every
/// requested key at once.
pub fn group_by_key<Key, Row, Error>(
    keys: &[Key],
    rows: impl IntoIterator<Item = Row>,
    mut key_of: impl FnMut(&Row) -> &Key,
) -> Vec<Result<Vec<Row>, Error>>
where
    Key: Eq + Hash,
{
    let positions = first_positions(keys);

    let mut groups: Vec<Vec<Row>> = keys.iter().map(|_| Vec::new()).collect();
    for row in rows {
        let index = positions.get(key_of(&row)).copied();
        if let Some(index) = index {
            groups[index].push(row);
        }
    }

    groups.into_iter().map(Ok).collect()
}

fn first_positions<Key: Eq + Hash>(keys: &[Key]) -> HashMap<&Key, usize> {
    let mut positions = HashMap::with_capacity(keys.len());
    for (index, key) in keys.iter().enumerate() {
        positions.entry(key).or_insert(index);
    }
    positions
}
