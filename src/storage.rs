//! Persisted state: the current document (page images and source bytes),
//! the flashcard deck and saved mind maps.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::flashcards::{Deck, Flashcard};
use crate::mindmap::MindMap;
use crate::pages::PageImage;

/// Key of the single stored document.
pub const CURRENT_KEY: &str = "current";
pub const DEFAULT_MINDMAP: &str = "current";

/// Stores the page list of the current document. An empty list clears
/// both the pages and the stored file.
pub async fn store_pages(pool: &SqlitePool, pages: &[PageImage]) -> Result<()> {
    if pages.is_empty() {
        return clear_document(pool).await;
    }
    let encoded = serde_json::to_string(pages).context("Failed to encode page list")?;
    sqlx::query(
        r#"INSERT INTO pdf_pages (key, pages, updated_at) VALUES (?, ?, ?)
           ON CONFLICT(key) DO UPDATE SET pages = excluded.pages, updated_at = excluded.updated_at"#,
    )
    .bind(CURRENT_KEY)
    .bind(encoded)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .context("Failed to store PDF pages")?;
    tracing::info!(pages = pages.len(), "stored PDF pages");
    Ok(())
}

pub async fn retrieve_pages(pool: &SqlitePool) -> Result<Vec<PageImage>> {
    let encoded: Option<String> = sqlx::query_scalar("SELECT pages FROM pdf_pages WHERE key = ?")
        .bind(CURRENT_KEY)
        .fetch_optional(pool)
        .await
        .context("Failed to retrieve PDF pages")?;

    match encoded {
        Some(encoded) => serde_json::from_str(&encoded).context("Stored page list is corrupt"),
        None => Ok(Vec::new()),
    }
}

pub async fn store_file(pool: &SqlitePool, content: &[u8]) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO pdf_file (key, content, updated_at) VALUES (?, ?, ?)
           ON CONFLICT(key) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at"#,
    )
    .bind(CURRENT_KEY)
    .bind(content)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .context("Failed to store PDF file")?;
    Ok(())
}

pub async fn retrieve_file(pool: &SqlitePool) -> Result<Option<Vec<u8>>> {
    sqlx::query_scalar("SELECT content FROM pdf_file WHERE key = ?")
        .bind(CURRENT_KEY)
        .fetch_optional(pool)
        .await
        .context("Failed to retrieve PDF file")
}

pub async fn clear_document(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM pdf_pages WHERE key = ?")
        .bind(CURRENT_KEY)
        .execute(pool)
        .await
        .context("Failed to clear PDF pages")?;
    sqlx::query("DELETE FROM pdf_file WHERE key = ?")
        .bind(CURRENT_KEY)
        .execute(pool)
        .await
        .context("Failed to clear PDF file")?;
    tracing::info!("cleared stored document");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredFlashcard {
    pub id: i64,
    pub front: String,
    pub back: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct FlashcardRow {
    id: i64,
    front: String,
    back: String,
    created_at: String,
    updated_at: String,
}

impl From<FlashcardRow> for StoredFlashcard {
    fn from(r: FlashcardRow) -> Self {
        Self {
            id: r.id,
            front: r.front,
            back: r.back,
            created_at: r.created_at.parse().unwrap_or_else(|_| Utc::now()),
            updated_at: r.updated_at.parse().unwrap_or_else(|_| Utc::now()),
        }
    }
}

pub async fn list_flashcards(pool: &SqlitePool) -> Result<Vec<StoredFlashcard>> {
    let rows: Vec<FlashcardRow> = sqlx::query_as(
        "SELECT id, front, back, created_at, updated_at FROM flashcards ORDER BY position, id",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list flashcards")?;
    Ok(rows.into_iter().map(StoredFlashcard::from).collect())
}

pub async fn load_deck(pool: &SqlitePool) -> Result<Deck> {
    let cards = list_flashcards(pool)
        .await?
        .into_iter()
        .map(|card| Flashcard {
            front: card.front,
            back: card.back,
        })
        .collect();
    Ok(Deck::new(cards))
}

/// Replaces the stored deck. Cards whose text is unchanged at the same
/// position keep their creation time.
pub async fn save_deck(pool: &SqlitePool, deck: &Deck) -> Result<()> {
    let existing = list_flashcards(pool).await?;
    let now = Utc::now().to_rfc3339();
    let mut tx = pool.begin().await.context("Failed to start transaction")?;

    sqlx::query("DELETE FROM flashcards")
        .execute(&mut *tx)
        .await
        .context("Failed to clear flashcards")?;

    for (position, card) in deck.cards().iter().enumerate() {
        let (created_at, updated_at) = match existing.get(position) {
            Some(old) if old.front == card.front && old.back == card.back => {
                (old.created_at.to_rfc3339(), old.updated_at.to_rfc3339())
            }
            _ => (now.clone(), now.clone()),
        };
        sqlx::query(
            r#"INSERT INTO flashcards (position, front, back, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(position as i64)
        .bind(&card.front)
        .bind(&card.back)
        .bind(created_at)
        .bind(updated_at)
        .execute(&mut *tx)
        .await
        .context("Failed to save flashcard")?;
    }

    tx.commit().await.context("Failed to commit flashcards")?;
    tracing::info!(cards = deck.len(), "saved flashcard deck");
    Ok(())
}

pub async fn save_mindmap(pool: &SqlitePool, name: &str, map: &MindMap) -> Result<()> {
    let content = serde_json::to_string(map).context("Failed to encode mind map")?;
    sqlx::query(
        r#"INSERT INTO mindmaps (name, content, updated_at) VALUES (?, ?, ?)
           ON CONFLICT(name) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at"#,
    )
    .bind(name)
    .bind(content)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .context("Failed to save mind map")?;
    Ok(())
}

pub async fn load_mindmap(pool: &SqlitePool, name: &str) -> Result<Option<MindMap>> {
    let content: Option<String> = sqlx::query_scalar("SELECT content FROM mindmaps WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to load mind map")?;

    let Some(content) = content else {
        return Ok(None);
    };
    let map: MindMap = serde_json::from_str(&content).context("Stored mind map is corrupt")?;
    map.validate()
        .with_context(|| format!("Stored mind map '{name}' is invalid"))?;
    Ok(Some(map))
}

pub async fn list_mindmaps(pool: &SqlitePool) -> Result<Vec<String>> {
    sqlx::query_scalar("SELECT name FROM mindmaps ORDER BY updated_at DESC")
        .fetch_all(pool)
        .await
        .context("Failed to list mind maps")
}
