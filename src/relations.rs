//! Building blocks for resolving relations on top of [`Loader`]s.
//!
//! - [`load_through`] follows a one-to-many or many-to-many relation through
//!   a join table: first the links for a parent, then the linked entities.
//! - [`Selection`] describes which fields a request asked for, so that a
//!   resolver can skip loading relations nobody will see.
//! - [`RelationTable`] maps a `(type, field)` pair to the foreign key that
//!   resolves it, so relations can be declared once when the schema is built
//!   and dispatched by entity kind at request time.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::{batch::BatchFn, error::LoadError, loader::Loader};

/// Load the entities related to `parent` through a join table.
///
/// `links` loads the join rows for a parent key; `target` picks the related
/// entity's key out of each row; `entities` loads those. Both loaders batch
/// and deduplicate independently, so resolving this relation for many
/// parents at once costs one fetch of join rows and one fetch of entities.
///
/// The entities are returned in join row order. The first failure, from
/// either hop, fails the whole relation.
pub async fn load_through<Parent, Link, Key, Value, Error, Links, Entities>(
    links: &Loader<Parent, Vec<Link>, Error, Links>,
    entities: &Loader<Key, Value, Error, Entities>,
    parent: Parent,
    target: impl FnMut(&Link) -> Key,
) -> Result<Vec<Value>, LoadError<Error>>
where
    Parent: Eq + Hash + Clone,
    Link: Clone,
    Key: Eq + Hash + Clone,
    Value: Clone,
    Error: Clone,
    Links: BatchFn<Parent, Vec<Link>, Error>,
    Entities: BatchFn<Key, Value, Error>,
{
    let rows = links.load(parent).await?;
    let keys: Vec<Key> = rows.iter().map(target).collect();

    entities.load_many(keys).await.into_iter().collect()
}

/// The fields requested from an object, each with its own sub-selection.
///
/// A relation counts as requested whenever it appears in the selection, even
/// if only some of its sub-fields were asked for: the related entity has to
/// be loaded either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    fields: BTreeMap<String, Selection>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a leaf field.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.entry(name.into()).or_default();
        self
    }

    /// Add a field with a sub-selection, replacing any previous one.
    pub fn nested(mut self, name: impl Into<String>, selection: Selection) -> Self {
        self.fields.insert(name.into(), selection);
        self
    }

    pub fn is_requested(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Selection> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Selection {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Selection::new(), |selection, name| selection.field(name))
    }
}

/// A field resolved by loading an entity whose key is stored in another
/// field of the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey<Kind> {
    pub source_field: &'static str,
    pub kind: Kind,
}

/// The foreign-key relations of a schema, by type name and field name.
#[derive(Debug, Clone)]
pub struct RelationTable<Kind> {
    types: HashMap<String, HashMap<String, ForeignKey<Kind>>>,
}

impl<Kind> Default for RelationTable<Kind> {
    fn default() -> Self {
        Self {
            types: HashMap::new(),
        }
    }
}

impl<Kind: Copy> RelationTable<Kind> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `type_name.field` is an entity of `kind`, keyed by the
    /// value of `type_name.source_field`.
    pub fn with_foreign_key(
        mut self,
        type_name: impl Into<String>,
        field: impl Into<String>,
        source_field: &'static str,
        kind: Kind,
    ) -> Self {
        self.types
            .entry(type_name.into())
            .or_default()
            .insert(field.into(), ForeignKey { source_field, kind });
        self
    }

    pub fn lookup(&self, type_name: &str, field: &str) -> Option<ForeignKey<Kind>> {
        self.types.get(type_name)?.get(field).copied()
    }
}
