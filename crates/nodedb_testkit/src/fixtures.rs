//! Test fixtures and engine helpers.
//!
//! Provides a reference schema and engines wired to memory or file
//! stores, so tests start from a known shape:
//!
//! - `root` (embedded) holds `site` nodes by `name`
//! - `site` (embedded) holds `story` rows grouped by `category`, and a
//!   virtual `articles` collection of the same rows by `slug`
//! - `story` (table `story`) holds segmented `comment` rows
//! - `comment` (table `comment`)
//! - `user` (table `users`, ids from the `user_seq` sequence)

use nodedb_core::{
    ColumnType, CoreResult, Engine, EngineConfig, IdStrategy, LocalField, Mapping,
    MappingRegistry, Node, Relation, TableSpec,
};
use nodedb_storage::{EmbeddedStore, FileStore, MemoryDatabase, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Name of the relational source in the reference schema.
pub const SOURCE: &str = "main";

/// Builds the reference schema.
pub fn reference_registry() -> MappingRegistry {
    let mut registry = MappingRegistry::new();
    let mappings = [
        Mapping::embedded("root")
            .children(Relation::children("site").accessname("name"))
            .build(),
        Mapping::embedded("site")
            .property(Relation::primitive("name", "name"))
            .property(
                Relation::collection("articles", "story")
                    .constraint(LocalField::Id, "site_id")
                    .accessname("slug"),
            )
            .children(
                Relation::children("story")
                    .constraint(LocalField::Id, "site_id")
                    .group_by("category")
                    .order("id"),
            )
            .build(),
        Mapping::relational(
            "story",
            TableSpec::new(SOURCE, "story", "id").name_column("slug"),
        )
        .property(Relation::primitive("slug", "slug"))
        .property(Relation::primitive("title", "title"))
        .property(Relation::primitive("category", "category"))
        .property(Relation::primitive("body", "body"))
        .property(Relation::primitive("views", "views").column_type(ColumnType::Integer))
        .property(Relation::reference("site", "site_id", "site"))
        .children(
            Relation::children("comment")
                .constraint(LocalField::Id, "story_id")
                .order("id")
                .lazy(),
        )
        .build(),
        Mapping::relational("comment", TableSpec::new(SOURCE, "comment", "id"))
            .property(Relation::primitive("text", "text"))
            .property(Relation::reference("story", "story_id", "story"))
            .build(),
        Mapping::relational(
            "user",
            TableSpec::new(SOURCE, "users", "id")
                .name_column("login")
                .id_strategy(IdStrategy::Sequence("user_seq".to_string())),
        )
        .property(Relation::primitive("login", "login"))
        .property(Relation::primitive("email", "email").private())
        .build(),
    ];
    for mapping in mappings {
        registry
            .register(mapping)
            .expect("reference schema registers");
    }
    registry
}

/// Creates the tables and sequences of the reference schema.
pub fn create_tables(db: &MemoryDatabase) {
    db.create_table("story", Some("id"));
    db.create_table("comment", Some("id"));
    db.create_table("users", Some("id"));
    db.create_sequence("user_seq", 100);
}

/// An engine over test stores with automatic cleanup.
pub struct TestEngine {
    /// The engine instance.
    pub engine: Engine,
    /// The relational database behind the `main` source.
    pub db: Arc<MemoryDatabase>,
    /// The embedded store.
    pub store: Arc<dyn EmbeddedStore>,
    /// The temporary directory of a file store (kept alive to prevent
    /// cleanup).
    dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine over memory stores.
    pub fn memory() -> Self {
        Self::memory_with_config(EngineConfig::default())
    }

    /// Creates an engine over memory stores with a custom configuration.
    pub fn memory_with_config(config: EngineConfig) -> Self {
        let db = Arc::new(MemoryDatabase::new());
        create_tables(&db);
        let store: Arc<dyn EmbeddedStore> = Arc::new(MemoryStore::new());
        Self::build(config, store, db, None)
    }

    /// Creates an engine whose embedded store is a file store in a
    /// temporary directory.
    pub fn file() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store: Arc<dyn EmbeddedStore> =
            Arc::new(FileStore::open(dir.path()).expect("Failed to open file store"));
        let db = Arc::new(MemoryDatabase::new());
        create_tables(&db);
        Self::build(EngineConfig::default(), store, db, Some(dir))
    }

    fn build(
        config: EngineConfig,
        store: Arc<dyn EmbeddedStore>,
        db: Arc<MemoryDatabase>,
        dir: Option<TempDir>,
    ) -> Self {
        let engine = Engine::builder()
            .config(config)
            .mappings(reference_registry())
            .embedded(Arc::clone(&store))
            .connection(SOURCE, db.clone())
            .build()
            .expect("Failed to build engine");
        Self {
            engine,
            db,
            store,
            dir,
        }
    }

    /// Shuts the engine down and opens a new one over the same stores,
    /// with an empty cache.
    pub fn reopen(self) -> Self {
        let Self {
            engine,
            db,
            store,
            dir,
        } = self;
        engine.shutdown().expect("Failed to shut down engine");
        drop(engine);
        let store = match &dir {
            Some(dir) => {
                drop(store);
                Arc::new(FileStore::open(dir.path()).expect("Failed to reopen file store"))
                    as Arc<dyn EmbeddedStore>
            }
            None => store,
        };
        Self::build(EngineConfig::default(), store, db, dir)
    }

    /// Returns the file store directory, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.path().to_path_buf())
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Runs a test with a fresh in-memory engine.
///
/// # Example
///
/// ```rust,ignore
/// use nodedb_testkit::with_engine;
///
/// #[test]
/// fn my_test() {
///     with_engine(|t| {
///         assert_eq!(t.root().unwrap().child_count().unwrap(), 0);
///     });
/// }
/// ```
pub fn with_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::memory();
    f(&engine)
}

/// Creates a site named `name` under the root. Needs a transaction.
///
/// # Errors
///
/// Returns whatever attaching the site returns.
pub fn add_site(engine: &Engine, name: &str) -> CoreResult<Arc<Node>> {
    let site = engine.create_node("site")?;
    site.set_string("name", name)?;
    engine.root()?.add_child(&site)?;
    Ok(site)
}

/// Creates a story under `site` in `category`. Needs a transaction.
///
/// # Errors
///
/// Returns whatever attaching the story returns.
pub fn add_story(engine: &Engine, site: &Arc<Node>, slug: &str, category: &str) -> CoreResult<Arc<Node>> {
    let story = engine.create_node("story")?;
    story.set_string("slug", slug)?;
    story.set_string("title", &format!("Story {slug}"))?;
    story.set_string("category", category)?;
    site.add_child(&story)?;
    Ok(story)
}

/// Creates `count` comments under `story`. Needs a transaction.
///
/// # Errors
///
/// Returns whatever attaching a comment returns.
pub fn add_comments(engine: &Engine, story: &Arc<Node>, count: usize) -> CoreResult<Vec<Arc<Node>>> {
    (0..count)
        .map(|i| {
            let comment = engine.create_node("comment")?;
            comment.set_string("text", &format!("comment {i}"))?;
            story.add_child(&comment)?;
            Ok(comment)
        })
        .collect()
}
