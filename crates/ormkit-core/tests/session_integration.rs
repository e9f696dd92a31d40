//! Integration tests for the unit of work against the sled backend.

use ormkit_core::catalog::{
    DeleteBehavior, EntityMetadata, FieldMetadata, MetadataRegistry, RelationMetadata, ScalarType,
};
use ormkit_core::serialize::{value_to_json, RelationView, SerializeOptions};
use ormkit_core::session::{
    EntityData, FindOptions, Reference, SessionConfig, SessionState, StagedOp, UnitOfWork,
};
use ormkit_core::storage::{
    BackendError, RelatedRequest, SledBackend, StorageBackend, StorageConfig,
};
use ormkit_core::Error;
use ormkit_proto::{ChangeBatch, KeyValue, PrimaryKey, Row};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Failure to inject into the next batch.
#[derive(Debug, Clone, Copy)]
enum Failure {
    Other,
    Interrupted,
}

/// Backend wrapper that counts reads, records batches and injects failures.
struct RecordingBackend {
    inner: SledBackend,
    key_loads: AtomicUsize,
    related_loads: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
    fail_next: Mutex<Option<Failure>>,
}

impl RecordingBackend {
    fn new(inner: SledBackend) -> Self {
        Self {
            inner,
            key_loads: AtomicUsize::new(0),
            related_loads: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    fn reads(&self) -> usize {
        self.key_loads.load(Ordering::SeqCst) + self.related_loads.load(Ordering::SeqCst)
    }

    fn fail_next(&self, failure: Failure) {
        *self.fail_next.lock() = Some(failure);
    }

    fn last_batch(&self) -> Vec<String> {
        self.batches.lock().last().cloned().unwrap_or_default()
    }

    fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }
}

impl StorageBackend for RecordingBackend {
    fn load_by_key(&self, entity: &str, key: &PrimaryKey) -> Result<Option<Row>, BackendError> {
        self.key_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_by_key(entity, key)
    }

    fn load_related(&self, request: &RelatedRequest) -> Result<Vec<Row>, BackendError> {
        self.related_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load_related(request)
    }

    fn apply_change_batch(&self, batch: &ChangeBatch) -> Result<(), BackendError> {
        if let Some(failure) = self.fail_next.lock().take() {
            return Err(match failure {
                Failure::Other => BackendError::Other("injected failure".into()),
                Failure::Interrupted => BackendError::Interrupted("connection reset".into()),
            });
        }
        self.inner.apply_change_batch(batch)?;
        let summary = batch
            .iter()
            .map(|c| format!("{} {} {}", c.kind(), c.entity(), c.key()))
            .collect();
        self.batches.lock().push(summary);
        Ok(())
    }
}

struct TestContext {
    registry: Arc<MetadataRegistry>,
    backend: Arc<RecordingBackend>,
}

impl TestContext {
    fn new() -> Self {
        let registry = Arc::new(library_registry());
        let storage = SledBackend::open(&StorageConfig::temporary(), Arc::clone(&registry)).unwrap();
        Self {
            registry,
            backend: Arc::new(RecordingBackend::new(storage)),
        }
    }

    fn session(&self) -> UnitOfWork {
        self.session_with(SessionConfig::default())
    }

    fn session_with(&self, config: SessionConfig) -> UnitOfWork {
        let backend: Arc<dyn StorageBackend> = self.backend.clone();
        UnitOfWork::with_config(Arc::clone(&self.registry), backend, config).unwrap()
    }

    fn count(&self, entity: &str) -> usize {
        self.backend.inner.count(entity).unwrap()
    }

    /// Store book 1 with two chapters, the first one current.
    fn seed_book(&self) {
        let mut uow = self.session();
        let book = uow
            .create(
                "Book",
                EntityData::new().set("id", 1).set("title", "Moby Dick").set("pages", 100),
            )
            .unwrap();
        let first = uow
            .create(
                "Chapter",
                EntityData::new().set("id", 1).set("title", "Loomings").reference("book", &book),
            )
            .unwrap();
        uow.create(
            "Chapter",
            EntityData::new().set("id", 2).set("title", "The Carpet-Bag").reference("book", &book),
        )
        .unwrap();
        book.set_reference("currentChapter", Some(Reference::from(&first))).unwrap();
        uow.flush().unwrap();
    }
}

fn library_registry() -> MetadataRegistry {
    let book = EntityMetadata::new("Book", "id")
        .with_field(FieldMetadata::new("id", ScalarType::Int32))
        .with_field(FieldMetadata::new("title", ScalarType::String))
        .with_field(
            FieldMetadata::new("pages", ScalarType::Int32)
                .with_serializer(|v| json!(v.as_i32().map(|p| p.to_string()))),
        )
        .with_relation(RelationMetadata::to_many("chapters", "Chapter", "book"))
        .with_relation(
            RelationMetadata::to_one("currentChapter", "Chapter")
                .nullable()
                .with_on_delete(DeleteBehavior::SetNull)
                .with_serializer(|view: &RelationView| {
                    view.one()
                        .and_then(|chapter| chapter.key_component("id"))
                        .map(|id| value_to_json(&id))
                        .unwrap_or(serde_json::Value::Null)
                }),
        );

    let chapter = EntityMetadata::new("Chapter", "id")
        .with_primary_key(["id", "book"])
        .with_field(FieldMetadata::new("id", ScalarType::Int32))
        .with_field(FieldMetadata::new("title", ScalarType::String))
        .with_relation(
            RelationMetadata::to_one("book", "Book")
                .hidden()
                .with_on_delete(DeleteBehavior::Cascade),
        );

    let membership = EntityMetadata::new("Membership", "org")
        .with_primary_key(["org", "user"])
        .with_field(FieldMetadata::new("org", ScalarType::String))
        .with_field(FieldMetadata::new("user", ScalarType::Int64))
        .with_field(FieldMetadata::optional("role", ScalarType::String));

    let node = EntityMetadata::new("Node", "id")
        .with_field(FieldMetadata::new("id", ScalarType::Int32))
        .with_relation(RelationMetadata::to_one("next", "Node"));

    // Posts go with their author; drafts are kept and orphaned.
    let author = EntityMetadata::new("Author", "id")
        .with_field(FieldMetadata::new("id", ScalarType::Int32))
        .with_field(FieldMetadata::new("name", ScalarType::String))
        .with_relation(
            RelationMetadata::to_many("posts", "Post", "author").with_on_delete(DeleteBehavior::Cascade),
        )
        .with_relation(
            RelationMetadata::to_many("drafts", "Draft", "author").with_on_delete(DeleteBehavior::SetNull),
        );

    let post = EntityMetadata::new("Post", "id")
        .with_field(FieldMetadata::new("id", ScalarType::Int32))
        .with_relation(RelationMetadata::to_one("author", "Author"));

    let draft = EntityMetadata::new("Draft", "id")
        .with_field(FieldMetadata::new("id", ScalarType::Int32))
        .with_relation(RelationMetadata::to_one("author", "Author").nullable());

    MetadataRegistry::new()
        .with_entity(book)
        .unwrap()
        .with_entity(chapter)
        .unwrap()
        .with_entity(membership)
        .unwrap()
        .with_entity(node)
        .unwrap()
        .with_entity(author)
        .unwrap()
        .with_entity(post)
        .unwrap()
        .with_entity(draft)
        .unwrap()
}

fn staged(uow: &UnitOfWork) -> Vec<(StagedOp, String)> {
    uow.pending_changes().into_iter().map(|c| (c.op, c.entity)).collect()
}

fn chapter_key(id: i32, book: i32) -> PrimaryKey {
    PrimaryKey::new(vec![KeyValue::from(id), KeyValue::from(book)]).unwrap()
}

#[test]
fn test_book_with_chapters_serializes() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();

    let book = uow
        .create(
            "Book",
            EntityData::new().set("id", 1).set("title", "Moby Dick").set("pages", 100),
        )
        .unwrap();
    let first = uow
        .create(
            "Chapter",
            EntityData::new().set("id", 1).set("title", "Loomings").reference("book", &book),
        )
        .unwrap();
    let second = uow
        .create(
            "Chapter",
            EntityData::new().set("id", 2).set("title", "The Carpet-Bag").reference("book", &book),
        )
        .unwrap();
    book.collection("chapters").unwrap().add(&[&first, &second]).unwrap();
    book.set_reference("currentChapter", Some(Reference::from(&first))).unwrap();
    uow.flush().unwrap();

    // The book was inserted before its chapters, its current chapter patched in afterwards.
    assert_eq!(
        ctx.backend.last_batch(),
        vec![
            "insert Book 1".to_string(),
            "insert Chapter (1, 1)".to_string(),
            "insert Chapter (2, 1)".to_string(),
            "update Book 1".to_string(),
        ]
    );

    let found = uow
        .find_with(
            "Book",
            1,
            &FindOptions::new().populate("chapters").populate("currentChapter"),
        )
        .unwrap();
    assert!(found.same_instance(&book));

    let object = uow.to_object(&found, &SerializeOptions::new()).unwrap();
    assert_eq!(
        object,
        json!({
            "id": 1,
            "title": "Moby Dick",
            "pages": "100",
            "chapters": [
                {"id": 1, "title": "Loomings"},
                {"id": 2, "title": "The Carpet-Bag"},
            ],
            "currentChapter": 1,
        })
    );
}

#[test]
fn test_reload_in_fresh_session() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow
        .find_with("Book", 1, &FindOptions::new().populate("chapters"))
        .unwrap();
    let object = uow.to_object(&book, &SerializeOptions::new()).unwrap();

    assert_eq!(object["pages"], json!("100"));
    assert_eq!(object["currentChapter"], json!(1));
    assert_eq!(object["chapters"].as_array().unwrap().len(), 2);
    assert_eq!(object["chapters"][0]["title"], json!("Loomings"));
}

#[test]
fn test_relation_override_needs_no_io() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow.find("Book", 1).unwrap();
    let reads = ctx.backend.reads();

    let current = book.reference("currentChapter").unwrap().unwrap();
    assert!(!current.is_loaded());

    let object = uow.to_object(&book, &SerializeOptions::new()).unwrap();
    assert_eq!(object["currentChapter"], json!(1));
    // Unloaded collections are left out rather than fetched.
    assert!(object.get("chapters").is_none());
    assert_eq!(ctx.backend.reads(), reads);
}

#[test]
fn test_serialize_options() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow.find("Book", 1).unwrap();
    let options = SerializeOptions::new()
        .populate("chapters")
        .exclude("title")
        .exclude("chapters.title");
    let object = uow.to_object(&book, &options).unwrap();

    assert!(object.get("title").is_none());
    assert_eq!(object["chapters"], json!([{"id": 1}, {"id": 2}]));
}

#[test]
fn test_identity_is_unique_per_session() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let chapter = uow.find("Chapter", chapter_key(1, 1)).unwrap();
    let again = uow.find("Chapter", chapter_key(1, 1)).unwrap();
    assert!(chapter.same_instance(&again));

    let book = uow.find("Book", 1).unwrap();
    let members = book.collection("chapters").unwrap().load(&mut uow).unwrap();
    assert_eq!(members.len(), 2);
    assert!(members[0].same_instance(&chapter));

    let key_loads = ctx.backend.key_loads.load(Ordering::SeqCst);
    let owner = uow.load_reference(&chapter, "book").unwrap().unwrap();
    assert!(owner.same_instance(&book));
    assert_eq!(ctx.backend.key_loads.load(Ordering::SeqCst), key_loads);

    // A second session hands out its own instances.
    let mut other = ctx.session();
    let foreign = other.find("Book", 1).unwrap();
    assert!(!foreign.same_instance(&book));
    assert!(!uow.is_managed(&foreign));
}

#[test]
fn test_missing_row_is_not_found() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();
    assert!(matches!(
        uow.find("Book", 42),
        Err(Error::NotFound { entity, .. }) if entity == "Book"
    ));
    assert!(matches!(uow.find("Shelf", 1), Err(Error::UnknownEntity(_))));
}

#[test]
fn test_create_validates_input() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();

    assert!(matches!(
        uow.create("Book", EntityData::new().set("id", 1).set("isbn", "x")),
        Err(Error::UnknownField { .. })
    ));
    assert!(matches!(
        uow.create("Book", EntityData::new().set("id", 1)),
        Err(Error::InvalidData(_))
    ));
    assert!(matches!(
        uow.create("Chapter", EntityData::new().set("id", 1).set("title", "Orphan")),
        Err(Error::InvalidData(_))
    ));
    assert_eq!(uow.managed_count(), 0);
    assert!(uow.pending_changes().is_empty());
}

#[test]
fn test_cascade_is_staged_before_flush() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow
        .find_with("Book", 1, &FindOptions::new().populate("chapters"))
        .unwrap();
    uow.remove(&book).unwrap();

    let pending = uow.pending_changes();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|c| c.op == StagedOp::Remove));
    assert_eq!(pending[0].entity, "Book");
    assert_eq!(pending[1].key, chapter_key(1, 1));
    assert_eq!(pending[2].key, chapter_key(2, 1));

    uow.flush().unwrap();
    assert_eq!(ctx.count("Book"), 0);
    assert_eq!(ctx.count("Chapter"), 0);
    assert!(book.is_removed());
    assert_eq!(uow.managed_count(), 0);
}

#[test]
fn test_set_null_is_staged_as_update() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow
        .find_with("Book", 1, &FindOptions::new().populate("currentChapter"))
        .unwrap();
    let current = uow.load_reference(&book, "currentChapter").unwrap().unwrap();
    uow.remove(&current).unwrap();

    assert!(book.reference("currentChapter").unwrap().is_none());
    assert!(!book.is_removed());
    let pending = uow.pending_changes();
    assert_eq!(pending.len(), 2);
    assert_eq!((pending[0].op, pending[0].entity.as_str()), (StagedOp::Persist, "Book"));
    assert_eq!((pending[1].op, pending[1].entity.as_str()), (StagedOp::Remove, "Chapter"));

    uow.flush().unwrap();
    assert_eq!(
        ctx.backend.last_batch(),
        vec!["update Book 1".to_string(), "delete Chapter (1, 1)".to_string()]
    );
    assert_eq!(ctx.count("Chapter"), 1);

    let mut fresh = ctx.session();
    let stored = fresh.find("Book", 1).unwrap();
    assert!(stored.reference("currentChapter").unwrap().is_none());
}

#[test]
fn test_removing_the_current_chapter_keeps_book_removal() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow.find("Book", 1).unwrap();
    uow.remove(&book).unwrap();
    assert_eq!(staged(&uow), vec![(StagedOp::Remove, "Book".to_string())]);

    // The book points at this chapter with a set-null policy, but is
    // already leaving: it must not be turned back into an update.
    let chapter = uow.find("Chapter", chapter_key(1, 1)).unwrap();
    uow.remove(&chapter).unwrap();
    assert_eq!(
        staged(&uow),
        vec![(StagedOp::Remove, "Book".to_string()), (StagedOp::Remove, "Chapter".to_string())]
    );
    assert_eq!(
        book.reference("currentChapter").unwrap(),
        Some(Reference::from_key("Chapter", chapter_key(1, 1)))
    );

    // A later persist does not cancel the removal either.
    uow.persist(&book).unwrap();
    assert_eq!(staged(&uow)[0], (StagedOp::Remove, "Book".to_string()));

    uow.flush().unwrap();
    assert!(book.is_removed());
    assert_eq!(ctx.count("Book"), 0);
    assert_eq!(ctx.count("Chapter"), 0);
}

#[test]
fn test_collection_delete_policies() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();
    let author = uow
        .create("Author", EntityData::new().set("id", 1).set("name", "Ishmael"))
        .unwrap();
    for id in 1..=2 {
        uow.create("Post", EntityData::new().set("id", id).reference("author", &author))
            .unwrap();
    }
    uow.create("Draft", EntityData::new().set("id", 1).reference("author", &author))
        .unwrap();
    uow.flush().unwrap();

    let mut uow = ctx.session();
    let author = uow
        .find_with("Author", 1, &FindOptions::new().populate("posts").populate("drafts"))
        .unwrap();
    let posts = author.collection("posts").unwrap().entities();
    let drafts = author.collection("drafts").unwrap().entities();
    assert_eq!((posts.len(), drafts.len()), (2, 1));

    uow.remove(&author).unwrap();
    assert_eq!(
        staged(&uow),
        vec![
            (StagedOp::Persist, "Draft".to_string()),
            (StagedOp::Remove, "Author".to_string()),
            (StagedOp::Remove, "Post".to_string()),
            (StagedOp::Remove, "Post".to_string()),
        ]
    );
    assert!(drafts[0].reference("author").unwrap().is_none());
    assert!(posts.iter().all(|post| !post.is_removed()));

    uow.flush().unwrap();
    assert!(posts.iter().all(|post| post.is_removed()));
    assert_eq!((ctx.count("Author"), ctx.count("Post"), ctx.count("Draft")), (0, 0, 1));

    let mut fresh = ctx.session();
    let draft = fresh.find("Draft", 1).unwrap();
    assert!(draft.reference("author").unwrap().is_none());
}

#[test]
fn test_cascade_depth_limit() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session_with(SessionConfig::new().with_max_cascade_depth(0));
    let book = uow
        .find_with("Book", 1, &FindOptions::new().populate("chapters"))
        .unwrap();
    assert!(matches!(
        uow.remove(&book),
        Err(Error::CascadeDepthExceeded { depth: 1 })
    ));
    assert!(uow.pending_changes().is_empty());
}

#[test]
fn test_removing_new_entity_discards_it() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();
    let book = uow
        .create("Book", EntityData::new().set("id", 9).set("title", "Draft").set("pages", 1))
        .unwrap();
    uow.remove(&book).unwrap();

    assert!(book.is_removed());
    assert!(!uow.is_managed(&book));
    assert!(uow.pending_changes().is_empty());
    uow.flush().unwrap();
    assert_eq!(ctx.backend.batch_count(), 0);
}

#[test]
fn test_dirty_instances_are_updated() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow.find("Book", 1).unwrap();
    book.set("title", "Moby-Dick; or, The Whale").unwrap();
    uow.flush().unwrap();
    assert_eq!(ctx.backend.last_batch(), vec!["update Book 1".to_string()]);

    // Nothing changed since: no batch.
    let batches = ctx.backend.batch_count();
    uow.flush().unwrap();
    assert_eq!(ctx.backend.batch_count(), batches);

    let mut fresh = ctx.session();
    let stored = fresh.find("Book", 1).unwrap();
    assert_eq!(stored.get("title").unwrap().as_str(), Some("Moby-Dick; or, The Whale"));
}

#[test]
fn test_dirty_check_can_be_disabled() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session_with(SessionConfig::new().without_dirty_check());
    let book = uow.find("Book", 1).unwrap();
    book.set("pages", 120).unwrap();

    let batches = ctx.backend.batch_count();
    uow.flush().unwrap();
    assert_eq!(ctx.backend.batch_count(), batches);

    uow.persist_and_flush(&book).unwrap();
    assert_eq!(ctx.backend.last_batch(), vec!["update Book 1".to_string()]);
}

#[test]
fn test_composite_key_round_trip() {
    let ctx = TestContext::new();
    let key = PrimaryKey::new(vec![KeyValue::from("acme"), KeyValue::from(7i64)]).unwrap();

    let mut uow = ctx.session();
    let membership = uow
        .create(
            "Membership",
            EntityData::new().set("org", "acme").set("user", 7i64).set("role", "admin"),
        )
        .unwrap();
    assert_eq!(membership.key(), key);
    uow.flush().unwrap();

    uow.clear().unwrap();
    let loaded = uow.find("Membership", key.clone()).unwrap();
    assert!(!loaded.same_instance(&membership));
    assert_eq!(loaded.key(), key);
    assert_eq!(loaded.get("role").unwrap().as_str(), Some("admin"));

    let object = uow.to_object(&loaded, &SerializeOptions::new()).unwrap();
    assert_eq!(object, json!({"org": "acme", "user": 7, "role": "admin"}));
}

#[test]
fn test_find_coerces_key_types() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    uow.create("Membership", EntityData::new().set("org", "acme").set("user", 7i64))
        .unwrap();
    uow.flush().unwrap();
    uow.clear().unwrap();

    // Narrow literals find a wide key column, and the other way around.
    let narrow = PrimaryKey::new(vec![KeyValue::from("acme"), KeyValue::from(7i32)]).unwrap();
    let membership = uow.find("Membership", narrow).unwrap();
    assert_eq!(
        membership.key(),
        PrimaryKey::new(vec![KeyValue::from("acme"), KeyValue::from(7i64)]).unwrap()
    );
    let book = uow.find("Book", 1i64).unwrap();
    assert_eq!(book.key(), PrimaryKey::single(1i32));
    assert!(uow.find("Book", 1i32).unwrap().same_instance(&book));

    assert!(matches!(uow.find("Book", "one"), Err(Error::InvalidData(_))));
    assert!(matches!(uow.find("Book", chapter_key(1, 1)), Err(Error::InvalidData(_))));

    // References built from a bare key are normalized the same way.
    let by_key = Reference::from_key("Book", PrimaryKey::single(1i64));
    let chapter = uow
        .create("Chapter", EntityData::new().set("id", 3).set("title", "The Spouter-Inn").reference("book", by_key))
        .unwrap();
    assert_eq!(chapter.key(), chapter_key(3, 1));
    assert_eq!(chapter.reference("book").unwrap(), Some(Reference::from(&book)));
    uow.flush().unwrap();
    assert_eq!(ctx.count("Chapter"), 3);
}

#[test]
fn test_key_is_immutable() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();
    let book = uow
        .create("Book", EntityData::new().set("id", 3).set("title", "Typee").set("pages", 300))
        .unwrap();
    assert!(matches!(book.set("id", 4), Err(Error::InvalidData(_))));
    assert_eq!(book.key(), PrimaryKey::single(3));
}

#[test]
fn test_cleared_entities_are_detached() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow.find("Book", 1).unwrap();
    uow.clear().unwrap();

    assert!(matches!(uow.persist(&book), Err(Error::DetachedEntity { .. })));
    assert!(matches!(uow.remove(&book), Err(Error::DetachedEntity { .. })));
    assert!(matches!(
        uow.load_collection(&book, "chapters"),
        Err(Error::DetachedEntity { .. })
    ));
    assert!(matches!(
        book.collection("chapters").unwrap().load(&mut uow),
        Err(Error::DetachedEntity { .. })
    ));

    // Serializing the current state needs no session access.
    let object = uow.to_object(&book, &SerializeOptions::new()).unwrap();
    assert_eq!(object["title"], json!("Moby Dick"));

    let reloaded = uow.find("Book", 1).unwrap();
    assert!(!reloaded.same_instance(&book));
}

#[test]
fn test_closed_session_rejects_work() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();
    uow.close();

    assert_eq!(uow.state(), SessionState::Closed);
    assert!(matches!(
        uow.create("Book", EntityData::new().set("id", 1).set("title", "x").set("pages", 1)),
        Err(Error::SessionClosed)
    ));
    assert!(matches!(uow.find("Book", 1), Err(Error::SessionClosed)));
    assert!(matches!(uow.flush(), Err(Error::SessionClosed)));
    assert!(matches!(uow.clear(), Err(Error::SessionClosed)));
}

#[test]
fn test_failed_flush_can_be_retried() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();
    uow.create("Book", EntityData::new().set("id", 5).set("title", "Omoo").set("pages", 200))
        .unwrap();

    ctx.backend.fail_next(Failure::Other);
    assert!(matches!(uow.flush(), Err(Error::Backend(_))));
    assert_eq!(uow.state(), SessionState::ActiveWithError);
    assert_eq!(uow.pending_changes().len(), 1);
    assert_eq!(ctx.count("Book"), 0);

    uow.flush().unwrap();
    assert_eq!(uow.state(), SessionState::Active);
    assert!(uow.pending_changes().is_empty());
    assert_eq!(ctx.count("Book"), 1);
}

#[test]
fn test_interrupted_flush_only_allows_close() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();
    uow.create("Book", EntityData::new().set("id", 6).set("title", "Mardi").set("pages", 400))
        .unwrap();

    ctx.backend.fail_next(Failure::Interrupted);
    assert!(matches!(uow.flush(), Err(Error::FlushInterrupted)));
    assert_eq!(uow.state(), SessionState::Interrupted);
    assert!(matches!(uow.find("Book", 6), Err(Error::FlushInterrupted)));
    assert!(matches!(uow.flush(), Err(Error::FlushInterrupted)));

    uow.close();
    assert_eq!(uow.state(), SessionState::Closed);
}

#[test]
fn test_inserts_follow_references() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();

    // The chapter is staged before the book it belongs to.
    let chapter = uow
        .create(
            "Chapter",
            EntityData::new()
                .set("id", 1)
                .set("title", "Prologue")
                .reference("book", Reference::from_key("Book", PrimaryKey::single(8))),
        )
        .unwrap();
    uow.create("Book", EntityData::new().set("id", 8).set("title", "Pierre").set("pages", 500))
        .unwrap();
    assert_eq!(chapter.key(), chapter_key(1, 8));

    uow.flush().unwrap();
    assert_eq!(
        ctx.backend.last_batch(),
        vec!["insert Book 8".to_string(), "insert Chapter (1, 8)".to_string()]
    );
}

#[test]
fn test_required_cycle_is_rejected() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();

    uow.create(
        "Node",
        EntityData::new()
            .set("id", 1)
            .reference("next", Reference::from_key("Node", PrimaryKey::single(2))),
    )
    .unwrap();
    uow.create(
        "Node",
        EntityData::new()
            .set("id", 2)
            .reference("next", Reference::from_key("Node", PrimaryKey::single(1))),
    )
    .unwrap();

    assert!(matches!(uow.flush(), Err(Error::ConstraintViolation(_))));
    assert_eq!(uow.state(), SessionState::ActiveWithError);
    assert_eq!(uow.pending_changes().len(), 2);
    assert_eq!(ctx.backend.batch_count(), 0);
}

#[test]
fn test_restricted_delete_is_rejected_by_storage() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();

    // Node 2 points at itself, node 1 points at node 2.
    uow.create(
        "Node",
        EntityData::new()
            .set("id", 1)
            .reference("next", Reference::from_key("Node", PrimaryKey::single(2))),
    )
    .unwrap();
    uow.create(
        "Node",
        EntityData::new()
            .set("id", 2)
            .reference("next", Reference::from_key("Node", PrimaryKey::single(2))),
    )
    .unwrap();
    uow.flush().unwrap();
    assert_eq!(
        ctx.backend.last_batch(),
        vec!["insert Node 2".to_string(), "insert Node 1".to_string()]
    );

    let mut fresh = ctx.session();
    let target = fresh.find("Node", 2).unwrap();
    fresh.remove(&target).unwrap();
    assert!(matches!(fresh.flush(), Err(Error::ConstraintViolation(_))));
    assert_eq!(fresh.state(), SessionState::ActiveWithError);
    assert_eq!(fresh.pending_changes().len(), 1);
    assert_eq!(ctx.count("Node"), 2);
}

#[test]
fn test_collection_membership_follows_key() {
    let ctx = TestContext::new();
    let mut uow = ctx.session();

    let first = uow
        .create("Book", EntityData::new().set("id", 1).set("title", "One").set("pages", 1))
        .unwrap();
    let second = uow
        .create("Book", EntityData::new().set("id", 2).set("title", "Two").set("pages", 2))
        .unwrap();
    let chapter = uow
        .create(
            "Chapter",
            EntityData::new().set("id", 1).set("title", "Staying").reference("book", &first),
        )
        .unwrap();

    let chapters = first.collection("chapters").unwrap();
    assert!(chapters.contains(&chapter));

    // The owning book is part of the chapter's key, so the chapter cannot move.
    assert!(matches!(
        second.collection("chapters").unwrap().add(&[&chapter]),
        Err(Error::InvalidData(_))
    ));
    assert!(second.collection("chapters").unwrap().is_empty());

    // Removing it from the collection leaves the back-reference alone.
    chapters.remove(&[&chapter]).unwrap();
    assert!(!chapters.contains(&chapter));
    assert_eq!(
        chapter.reference("book").unwrap().map(|r| r.key().clone()),
        Some(PrimaryKey::single(1))
    );

    // Members of the wrong type are rejected outright.
    assert!(matches!(
        chapters.add(&[&second]),
        Err(Error::InvalidData(_))
    ));
}

#[test]
fn test_unloaded_collection_keeps_local_additions() {
    let ctx = TestContext::new();
    ctx.seed_book();

    let mut uow = ctx.session();
    let book = uow.find("Book", 1).unwrap();
    let first = uow.find("Chapter", chapter_key(1, 1)).unwrap();
    first.set("title", "Loomings, revised").unwrap();
    let related_before = ctx.backend.related_loads.load(Ordering::SeqCst);

    let chapters = book.collection("chapters").unwrap();
    chapters.add(&[&first]).unwrap();
    let third = uow
        .create(
            "Chapter",
            EntityData::new().set("id", 3).set("title", "The Spouter-Inn").reference("book", &book),
        )
        .unwrap();

    // Adding never fetches the collection.
    assert!(!chapters.is_loaded());
    assert_eq!(chapters.len(), 2);
    assert_eq!(ctx.backend.related_loads.load(Ordering::SeqCst), related_before);

    let members = chapters.to_array(&mut uow).unwrap();
    assert!(chapters.is_loaded());
    assert_eq!(ctx.backend.related_loads.load(Ordering::SeqCst), related_before + 1);

    // Stored order first, the local instance in place of the stored row,
    // the unsaved chapter last.
    assert_eq!(members.len(), 3);
    assert!(members[0].same_instance(&first));
    assert_eq!(members[0].get("title").unwrap().as_str(), Some("Loomings, revised"));
    assert_eq!(members[1].key(), chapter_key(2, 1));
    assert!(members[2].same_instance(&third));

    chapters.to_array(&mut uow).unwrap();
    assert_eq!(ctx.backend.related_loads.load(Ordering::SeqCst), related_before + 1);
}
