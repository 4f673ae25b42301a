//! Resolve a couple of requests against the blog, logging every fetch.
//!
//! Run with `RUST_LOG=dataloaders=debug` to see batch windows open and close.

use std::sync::Arc;

use dataloaders::{
    blog::{post_authors, resolve_posts, user_posts, BlogResult, Loaders, MockDb},
    relations::Selection,
};
use futures::{executor, future::try_join_all};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> BlogResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db = Arc::new(MockDb::seeded());

    // { posts { title author { name } editor { name } } }
    let selection = Selection::new()
        .field("title")
        .nested("author", Selection::new().field("name"))
        .nested("editor", Selection::new().field("name"));

    let loaders = Loaders::new(Arc::clone(&db));
    let views = executor::block_on(resolve_posts(&db, &loaders, &selection))?;
    for view in &views {
        tracing::info!(
            title = %view.post.title,
            author = view.author.as_ref().map(|user| user.name.as_str()),
            editor = view.editor.as_ref().map(|user| user.name.as_str()),
            "post"
        );
    }

    // { users { name posts { title authors { name } } } }
    let loaders = Loaders::new(Arc::clone(&db));
    executor::block_on(async {
        let users = db.users();
        let posts = try_join_all(users.iter().map(|user| user_posts(user, &loaders))).await?;

        for (user, posts) in users.iter().zip(&posts) {
            let authors =
                try_join_all(posts.iter().map(|post| post_authors(post, &loaders))).await?;

            for (post, authors) in posts.iter().zip(authors) {
                let names: Vec<&str> = authors.iter().map(|user| user.name.as_str()).collect();
                tracing::info!(
                    user = %user.name,
                    post = %post.title,
                    authors = ?names,
                    "authored"
                );
            }
        }

        BlogResult::Ok(())
    })?;

    tracing::info!(fetches = db.fetches().len(), "done");
    Ok(())
}
