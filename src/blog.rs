//! A small blog, resolved with loaders.
//!
//! Users write and edit posts. Each post has an `author` and an `editor`
//! (one-to-one foreign keys), and an `authors` list through the `user_posts`
//! join table (many-to-many); each user has the matching `posts` list. The
//! data lives in a [`MockDb`] that records every fetch, which makes the
//! effect of batching easy to observe.
//!
//! A fresh [`Loaders`] is created for each request and passed to the
//! resolvers, so that nothing cached for one request leaks into another.

use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

use futures::future::{try_join_all, BoxFuture, FutureExt};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    batch::{lock, BatchFn},
    data::{align_by_key, group_by_key, BatchResult, KeyedEntry},
    error::LoadError,
    loader::Loader,
    options::LoaderOptions,
    relations::{load_through, RelationTable, Selection},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub author_id: String,
    pub editor_id: String,
}

impl Post {
    /// Look up a scalar field by its schema name.
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "id" => Some(&self.id),
            "title" => Some(&self.title),
            "authorId" => Some(&self.author_id),
            "editorId" => Some(&self.editor_id),
            _ => None,
        }
    }
}

/// A row of the `user_posts` join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPost {
    pub user_id: String,
    pub post_id: String,
}

impl KeyedEntry<String> for User {
    fn key(&self) -> &String {
        &self.id
    }
}

impl KeyedEntry<String> for Post {
    fn key(&self) -> &String {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Posts,
    UserPosts,
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Table::Users => "users",
            Table::Posts => "posts",
            Table::UserPosts => "user_posts",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("no row in {table} with id {id}")]
    NotFound { table: Table, id: String },

    #[error("table {0} is unavailable")]
    Unavailable(Table),
}

/// One query against the mock database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetch {
    pub table: Table,
    pub ids: Vec<String>,
}

/// An in-memory stand-in for the data layer. Every lookup takes a whole set
/// of ids, the way a `WHERE id IN (...)` query would, and returns matching
/// rows in table order.
#[derive(Debug, Default)]
pub struct MockDb {
    users: Vec<User>,
    posts: Vec<Post>,
    user_posts: Vec<UserPost>,
    fetches: Mutex<Vec<Fetch>>,
    unavailable: Mutex<Vec<Table>>,
}

impl MockDb {
    pub fn new(users: Vec<User>, posts: Vec<Post>, user_posts: Vec<UserPost>) -> Self {
        Self {
            users,
            posts,
            user_posts,
            ..Self::default()
        }
    }

    /// Two users, three posts, and four authorship links.
    pub fn seeded() -> Self {
        let user = |id: &str, name: &str| User {
            id: id.into(),
            name: name.into(),
        };
        let post = |id: &str, author_id: &str, editor_id: &str| Post {
            id: id.into(),
            title: format!("Post {}", id),
            author_id: author_id.into(),
            editor_id: editor_id.into(),
        };
        let link = |user_id: &str, post_id: &str| UserPost {
            user_id: user_id.into(),
            post_id: post_id.into(),
        };

        Self::new(
            vec![user("1", "Alice"), user("2", "Bob")],
            vec![post("1", "1", "2"), post("2", "1", "1"), post("3", "2", "1")],
            vec![link("1", "1"), link("1", "2"), link("2", "2"), link("2", "3")],
        )
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    /// Every fetch made so far, in order.
    pub fn fetches(&self) -> Vec<Fetch> {
        lock(&self.fetches).clone()
    }

    pub fn fetches_from(&self, table: Table) -> Vec<Vec<String>> {
        lock(&self.fetches)
            .iter()
            .filter(|fetch| fetch.table == table)
            .map(|fetch| fetch.ids.clone())
            .collect()
    }

    /// Make every fetch from `table` fail (or succeed again).
    pub fn set_available(&self, table: Table, available: bool) {
        let mut unavailable = lock(&self.unavailable);
        unavailable.retain(|&t| t != table);
        if !available {
            unavailable.push(table);
        }
    }

    fn record(&self, table: Table, ids: &[String]) -> Result<(), DbError> {
        info!(%table, ?ids, "fetching");
        lock(&self.fetches).push(Fetch {
            table,
            ids: ids.to_vec(),
        });

        if lock(&self.unavailable).contains(&table) {
            Err(DbError::Unavailable(table))
        } else {
            Ok(())
        }
    }

    pub async fn users_by_ids(&self, ids: &[String]) -> Result<Vec<User>, DbError> {
        self.record(Table::Users, ids)?;
        Ok(self
            .users
            .iter()
            .filter(|user| ids.contains(&user.id))
            .cloned()
            .collect())
    }

    pub async fn posts_by_ids(&self, ids: &[String]) -> Result<Vec<Post>, DbError> {
        self.record(Table::Posts, ids)?;
        Ok(self
            .posts
            .iter()
            .filter(|post| ids.contains(&post.id))
            .cloned()
            .collect())
    }

    pub async fn links_by_post_ids(&self, post_ids: &[String]) -> Result<Vec<UserPost>, DbError> {
        self.record(Table::UserPosts, post_ids)?;
        Ok(self
            .user_posts
            .iter()
            .filter(|link| post_ids.contains(&link.post_id))
            .cloned()
            .collect())
    }

    pub async fn links_by_user_ids(&self, user_ids: &[String]) -> Result<Vec<UserPost>, DbError> {
        self.record(Table::UserPosts, user_ids)?;
        Ok(self
            .user_posts
            .iter()
            .filter(|link| user_ids.contains(&link.user_id))
            .cloned()
            .collect())
    }
}

/// Users by id.
#[derive(Debug, Clone)]
pub struct UsersById {
    db: Arc<MockDb>,
}

impl BatchFn<String, User, DbError> for UsersById {
    type Fut = BoxFuture<'static, BatchResult<User, DbError>>;

    fn load(&self, ids: Vec<String>) -> Self::Fut {
        let db = Arc::clone(&self.db);
        async move {
            let users = db.users_by_ids(&ids).await?;
            Ok(align_by_key(&ids, users, |id| DbError::NotFound {
                table: Table::Users,
                id: id.clone(),
            }))
        }
        .boxed()
    }
}

/// Posts by id.
#[derive(Debug, Clone)]
pub struct PostsById {
    db: Arc<MockDb>,
}

impl BatchFn<String, Post, DbError> for PostsById {
    type Fut = BoxFuture<'static, BatchResult<Post, DbError>>;

    fn load(&self, ids: Vec<String>) -> Self::Fut {
        let db = Arc::clone(&self.db);
        async move {
            let posts = db.posts_by_ids(&ids).await?;
            Ok(align_by_key(&ids, posts, |id| DbError::NotFound {
                table: Table::Posts,
                id: id.clone(),
            }))
        }
        .boxed()
    }
}

/// Authorship links by post id.
#[derive(Debug, Clone)]
pub struct LinksByPost {
    db: Arc<MockDb>,
}

impl BatchFn<String, Vec<UserPost>, DbError> for LinksByPost {
    type Fut = BoxFuture<'static, BatchResult<Vec<UserPost>, DbError>>;

    fn load(&self, post_ids: Vec<String>) -> Self::Fut {
        let db = Arc::clone(&self.db);
        async move {
            let links = db.links_by_post_ids(&post_ids).await?;
            Ok(group_by_key(&post_ids, links, |link| &link.post_id))
        }
        .boxed()
    }
}

/// Authorship links by user id.
#[derive(Debug, Clone)]
pub struct LinksByUser {
    db: Arc<MockDb>,
}

impl BatchFn<String, Vec<UserPost>, DbError> for LinksByUser {
    type Fut = BoxFuture<'static, BatchResult<Vec<UserPost>, DbError>>;

    fn load(&self, user_ids: Vec<String>) -> Self::Fut {
        let db = Arc::clone(&self.db);
        async move {
            let links = db.links_by_user_ids(&user_ids).await?;
            Ok(group_by_key(&user_ids, links, |link| &link.user_id))
        }
        .boxed()
    }
}

pub type UserLoader = Loader<String, User, DbError, UsersById>;
pub type PostLoader = Loader<String, Post, DbError, PostsById>;
pub type LinkLoader<Batcher> = Loader<String, Vec<UserPost>, DbError, Batcher>;

pub type BlogResult<T> = Result<T, LoadError<DbError>>;

/// The loaders for one request.
#[derive(Debug)]
pub struct Loaders {
    pub user: UserLoader,
    pub post: PostLoader,
    pub links_by_post: LinkLoader<LinksByPost>,
    pub links_by_user: LinkLoader<LinksByUser>,
}

impl Loaders {
    pub fn new(db: Arc<MockDb>) -> Self {
        Self::with_options(db, LoaderOptions::default())
    }

    pub fn with_options(db: Arc<MockDb>, options: LoaderOptions<String>) -> Self {
        Self {
            user: Loader::with_options(UsersById { db: Arc::clone(&db) }, options.clone()),
            post: Loader::with_options(PostsById { db: Arc::clone(&db) }, options.clone()),
            links_by_post: Loader::with_options(
                LinksByPost { db: Arc::clone(&db) },
                options.clone(),
            ),
            links_by_user: Loader::with_options(LinksByUser { db }, options),
        }
    }

    /// Load an entity of any kind by id.
    pub async fn load_entity(&self, kind: EntityKind, id: String) -> BlogResult<Entity> {
        match kind {
            EntityKind::User => self.user.load(id).await.map(Entity::User),
            EntityKind::Post => self.post.load(id).await.map(Entity::Post),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    User(User),
    Post(Post),
}

/// The blog's foreign-key relations: a post's `author` and `editor` are
/// users, keyed by `authorId` and `editorId`.
pub fn relations() -> RelationTable<EntityKind> {
    RelationTable::new()
        .with_foreign_key("Post", "author", "authorId", EntityKind::User)
        .with_foreign_key("Post", "editor", "editorId", EntityKind::User)
}

pub async fn post_author(post: &Post, loaders: &Loaders) -> BlogResult<User> {
    loaders.user.load(post.author_id.clone()).await
}

pub async fn post_editor(post: &Post, loaders: &Loaders) -> BlogResult<User> {
    loaders.user.load(post.editor_id.clone()).await
}

/// Every user linked to a post through `user_posts`.
pub async fn post_authors(post: &Post, loaders: &Loaders) -> BlogResult<Vec<User>> {
    load_through(
        &loaders.links_by_post,
        &loaders.user,
        post.id.clone(),
        |link| link.user_id.clone(),
    )
    .await
}

/// Every post linked to a user through `user_posts`.
pub async fn user_posts(user: &User, loaders: &Loaders) -> BlogResult<Vec<Post>> {
    load_through(
        &loaders.links_by_user,
        &loaders.post,
        user.id.clone(),
        |link| link.post_id.clone(),
    )
    .await
}

/// Resolve a `Post` field through the relation table. Fields that aren't
/// foreign-key relations, or whose key is missing, resolve to `None` and are
/// left to the post's own data.
pub async fn resolve_foreign_key(
    relations: &RelationTable<EntityKind>,
    post: &Post,
    field: &str,
    loaders: &Loaders,
) -> BlogResult<Option<Entity>> {
    let relation = match relations.lookup("Post", field) {
        Some(relation) => relation,
        None => return Ok(None),
    };

    match post.field(relation.source_field) {
        Some(id) if !id.is_empty() => loaders
            .load_entity(relation.kind, id.to_owned())
            .await
            .map(Some),
        _ => Ok(None),
    }
}

/// A post with whichever of its relations were requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostView {
    pub post: Post,
    pub author: Option<User>,
    pub editor: Option<User>,
}

/// Resolve every post, loading `author` and `editor` only if `selection`
/// asks for them. All posts are resolved concurrently, so the users they
/// need are fetched in one batch.
pub async fn resolve_posts(
    db: &MockDb,
    loaders: &Loaders,
    selection: &Selection,
) -> BlogResult<Vec<PostView>> {
    let author_requested = selection.is_requested("author");
    let editor_requested = selection.is_requested("editor");
    debug!(author_requested, editor_requested, "resolving posts");

    try_join_all(db.posts().iter().map(|post| async move {
        let author = async {
            if author_requested {
                post_author(post, loaders).await.map(Some)
            } else {
                Ok(None)
            }
        };
        let editor = async {
            if editor_requested {
                post_editor(post, loaders).await.map(Some)
            } else {
                Ok(None)
            }
        };

        let (author, editor) = futures::join!(author, editor);
        Ok::<_, LoadError<DbError>>(PostView {
            post: post.clone(),
            author: author?,
            editor: editor?,
        })
    }))
    .await
}
