//! Dataloaders is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader), for
//! resolving relational data (one-to-one, one-to-many, many-to-many) in a
//! graph-query API without N+1 fetches. It collects many independent "load
//! the value for key K" requests, issued from otherwise unrelated resolvers,
//! into a single call to a batch function, then hands each caller the result
//! for its own key.
//!
//! ## Overview
//!
//! As a simple example, suppose posts have an author, and resolving the
//! author of each of a hundred posts would otherwise mean a hundred user
//! lookups. The data layer can fetch many users at once:
//!
//! ```
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct DbError;
//!
//! async fn get_users(ids: &[u64]) -> Result<Vec<User>, DbError> {
//!     todo!()
//! }
//! ```
//!
//! A batch function takes the distinct keys requested during one batch
//! window, in the order they were first requested, and returns either one
//! result per key in that same order, or a single error if the whole fetch
//! failed. [`align_by_key`] turns an unordered set of rows into that shape,
//! reporting missing rows as per-key errors:
//!
//! ```
//! use dataloaders::{align_by_key, BatchResult, KeyedEntry};
//! # #[derive(Debug, Clone)] struct User { id: u64, name: String }
//! # #[derive(Debug, Clone)] struct DbError;
//! # async fn get_users(ids: &[u64]) -> Result<Vec<User>, DbError> { Ok(vec![]) }
//!
//! impl KeyedEntry<u64> for User {
//!     fn key(&self) -> &u64 {
//!         &self.id
//!     }
//! }
//!
//! async fn batch_get_users(ids: Vec<u64>) -> BatchResult<User, DbError> {
//!     let users = get_users(&ids).await?;
//!     Ok(align_by_key(&ids, users, |_id| DbError))
//! }
//! ```
//!
//! Wrap the batch function in a [`Loader`], one per request, and load keys
//! from anywhere that can see it:
//!
//! ```
//! use dataloaders::Loader;
//! use futures::{executor, join};
//! # use dataloaders::BatchResult;
//! # #[derive(Debug, Clone)] struct User { id: u64, name: String }
//! # #[derive(Debug, Clone)] struct DbError;
//! # async fn batch_get_users(ids: Vec<u64>) -> BatchResult<User, DbError> {
//! #     Ok(ids.into_iter().map(|id| Ok(User { id, name: String::new() })).collect())
//! # }
//!
//! let users = Loader::new(batch_get_users);
//!
//! executor::block_on(async {
//!     // Both keys land in the same batch window, so batch_get_users is
//!     // called once, with [1, 2].
//!     let (author, editor) = join!(users.load(1), users.load(2));
//!     assert_eq!(author.unwrap().id, 1);
//!     assert_eq!(editor.unwrap().id, 2);
//!
//!     // Already cached: no fetch at all.
//!     let author = users.load(1).await.unwrap();
//! });
//! ```
//!
//! ## Batch windows
//!
//! A batch window opens with the first key loaded after the previous window
//! closed, and stays open for [`LoaderOptions::window`]. Every key loaded
//! while it is open joins the batch. The window closes early when it reaches
//! [`LoaderOptions::max_batch_size`] distinct keys, or when
//! [`Loader::dispatch`] is called. With a zero window the batch is
//! dispatched on the first poll, which still gathers every key loaded
//! before the first `.await`.
//!
//! ## Caching and errors
//!
//! Successful values are cached for the life of the loader, and a key that
//! is already being fetched joins the in-flight batch rather than starting
//! another. Failures are never cached: the next load of a failed key fetches
//! again. See [`LoadError`] for the ways a load can fail.
//!
//! ## Poll-driven design
//!
//! All of the asynchronous work is driven by polling [`LoadFuture`]s. The
//! batch function is not spawned onto any runtime; it is driven in the
//! foreground by whichever waiting future was polled most recently. The
//! others are woken when the result is ready, or when the driving future is
//! dropped, in which case one of them takes over. This makes the crate
//! runtime-agnostic.
//!
//! ## Relations
//!
//! The [`relations`] module has helpers for resolving relations on top of
//! loaders, and the [`blog`] module is a worked example of all three shapes
//! of relation over an in-memory database.

mod batch;
mod cache;
mod data;
mod error;
mod loader;
mod options;
mod wakerset;

pub mod blog;
pub mod relations;

pub use batch::BatchFn;
pub use data::{align_by_key, group_by_key, BatchResult, KeyedEntry};
pub use error::LoadError;
pub use loader::{LoadFuture, Loader};
pub use options::{CacheKeyFn, LoaderOptions};

#[cfg(test)]
mod test;
