use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::io::{Cursor, Write};
use zip::write::{FileOptions, ZipWriter};

use crate::storage;

/// Bundles everything persisted into one zip: every saved mind map as JSON
/// and Mermaid, the flashcard deck, the current page images and the
/// source file. Returns an empty buffer when nothing is stored.
pub async fn export_bundle(pool: &SqlitePool) -> Result<Vec<u8>> {
    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();

    for name in storage::list_mindmaps(pool).await? {
        let Some(map) = storage::load_mindmap(pool, &name).await? else {
            continue;
        };
        let stem = entry_stem(&name);
        let json = serde_json::to_vec_pretty(&map).context("Failed to encode mind map")?;
        entries.push((format!("mindmaps/{stem}.json"), json));
        entries.push((format!("mindmaps/{stem}.mmd"), map.to_mermaid().into_bytes()));
    }

    let cards = storage::list_flashcards(pool).await?;
    if !cards.is_empty() {
        let json = serde_json::to_vec_pretty(&cards).context("Failed to encode flashcards")?;
        entries.push(("flashcards.json".to_string(), json));
    }

    for (idx, page) in storage::retrieve_pages(pool).await?.iter().enumerate() {
        let bytes = page
            .decode()
            .with_context(|| format!("Stored page {} is not valid base64", idx + 1))?;
        entries.push((format!("pages/page-{:03}.{}", idx + 1, page.extension()), bytes));
    }

    if let Some(file) = storage::retrieve_file(pool).await? {
        entries.push(("document.pdf".to_string(), file));
    }

    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let mut cursor = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    let options: FileOptions<()> = FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);

    for (filename, content) in &entries {
        zip.start_file(filename.as_str(), options)
            .with_context(|| format!("Failed to start zip entry {filename}"))?;
        zip.write_all(content)
            .with_context(|| format!("Failed to write zip entry {filename}"))?;
    }

    zip.finish()
        .with_context(|| "Failed to finalize ZIP file".to_string())?;

    tracing::info!(entries = entries.len(), "exported bundle");
    Ok(cursor.into_inner())
}

fn entry_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if stem.is_empty() { "mindmap".to_string() } else { stem }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseConfig};
    use crate::flashcards::Deck;
    use crate::mindmap::MindMap;
    use crate::pages::PageImage;
    use std::io::Read;
    use tempfile::TempDir;

    async fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        };
        (Database::new(config).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn empty_store_exports_nothing() {
        let (db, _dir) = setup_test_db().await;
        assert!(export_bundle(db.pool()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bundle_export() {
        let (db, _dir) = setup_test_db().await;
        let pool = db.pool();

        storage::save_mindmap(pool, "biology notes", &MindMap::default()).await.unwrap();
        let mut deck = Deck::default();
        deck.add("Q", "A").unwrap();
        storage::save_deck(pool, &deck).await.unwrap();
        storage::store_pages(pool, &[PageImage::from_bytes("image/png", b"png-bytes")])
            .await
            .unwrap();
        storage::store_file(pool, b"%PDF").await.unwrap();

        let zip_data = export_bundle(pool).await.unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(zip_data)).unwrap();
        assert_eq!(zip.len(), 5);

        let mut mermaid = String::new();
        zip.by_name("mindmaps/biology_notes.mmd")
            .unwrap()
            .read_to_string(&mut mermaid)
            .unwrap();
        assert!(mermaid.starts_with("graph LR"));

        let mut page = Vec::new();
        zip.by_name("pages/page-001.png").unwrap().read_to_end(&mut page).unwrap();
        assert_eq!(page, b"png-bytes");
        assert!(zip.by_name("flashcards.json").is_ok());
        assert!(zip.by_name("document.pdf").is_ok());
    }
}
