//! Sample library schema: books and their chapters.

use ormkit_core::serialize::value_to_json;
use ormkit_core::session::{EntityData, FindOptions, Reference, SessionConfig, UnitOfWork};
use ormkit_core::storage::StorageBackend;
use ormkit_core::{
    DeleteBehavior, EntityMetadata, Error, FieldMetadata, MetadataRegistry, RelationMetadata,
    RelationView, ScalarType, SerializeOptions, SledBackend,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

const CHAPTERS: [&str; 3] = ["Loomings", "The Carpet-Bag", "The Spouter-Inn"];

/// What the demo printed and what storage holds afterwards.
#[derive(Debug, Serialize)]
pub struct Report {
    pub book: serde_json::Value,
    pub created: bool,
    pub removed: bool,
    pub stored_books: usize,
    pub stored_chapters: usize,
}

pub fn registry() -> Result<MetadataRegistry, Error> {
    let book = EntityMetadata::new("Book", "id")
        .with_field(FieldMetadata::new("id", ScalarType::Int32))
        .with_field(FieldMetadata::new("title", ScalarType::String))
        .with_field(
            FieldMetadata::new("pages", ScalarType::Int32)
                .with_serializer(|v| serde_json::json!(v.as_i32().map(|p| p.to_string()))),
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

    MetadataRegistry::new().with_entity(book)?.with_entity(chapter)
}

pub fn run(
    registry: Arc<MetadataRegistry>,
    storage: Arc<SledBackend>,
    config: SessionConfig,
    book_id: i32,
    remove: bool,
) -> Result<Report, Box<dyn std::error::Error>> {
    let backend: Arc<dyn StorageBackend> = storage.clone();

    let mut writer = UnitOfWork::with_config(Arc::clone(&registry), Arc::clone(&backend), config.clone())?;
    let created = match writer.find("Book", book_id) {
        Ok(_) => false,
        Err(Error::NotFound { .. }) => {
            store_book(&mut writer, book_id)?;
            true
        }
        Err(e) => return Err(e.into()),
    };
    writer.close();

    let mut reader = UnitOfWork::with_config(registry, backend, config)?;
    let options = FindOptions::new().populate("chapters").populate("currentChapter");
    let book = reader.find_with("Book", book_id, &options)?;
    let json = reader.to_object(&book, &SerializeOptions::new())?;

    if remove {
        reader.remove(&book)?;
        info!(staged = reader.pending_changes().len(), "removing book");
        reader.flush()?;
    }

    Ok(Report {
        book: json,
        created,
        removed: remove,
        stored_books: storage.count("Book")?,
        stored_chapters: storage.count("Chapter")?,
    })
}

fn store_book(uow: &mut UnitOfWork, book_id: i32) -> Result<(), Error> {
    let book = uow.create(
        "Book",
        EntityData::new()
            .set("id", book_id)
            .set("title", "Moby Dick")
            .set("pages", 635),
    )?;

    let mut first = None;
    for (id, title) in (1..).zip(CHAPTERS) {
        let chapter = uow.create(
            "Chapter",
            EntityData::new()
                .set("id", id)
                .set("title", title)
                .reference("book", &book),
        )?;
        first.get_or_insert(chapter);
    }
    book.set_reference("currentChapter", first.as_ref().map(Reference::from))?;

    uow.flush()?;
    info!(book = book_id, chapters = CHAPTERS.len(), "stored book");
    Ok(())
}
