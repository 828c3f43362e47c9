use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn studyhub(db: &Path) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("studyhub")?;
    cmd.env("STUDYHUB_DB_PATH", db).env_remove("GEMINI_API_KEY");
    Ok(cmd)
}

#[test]
fn landing_lists_tools() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    studyhub(&tmp.path().join("db.sqlite"))?
        .assert()
        .success()
        .stdout(predicate::str::contains("mindmap-manual"))
        .stdout(predicate::str::contains("PDF chat"));
    Ok(())
}

#[test]
fn flashcards_add_list_and_delete() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    let db = tmp.path().join("db.sqlite");

    studyhub(&db)?
        .args(["flashcards", "add", "--front", "What is ATP?", "--back", "Energy currency"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added card 1."));
    studyhub(&db)?
        .args(["flashcards", "add", "--front", "Mitosis", "--back", "Cell division"])
        .assert()
        .success();

    studyhub(&db)?
        .args(["flashcards", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. What is ATP?"))
        .stdout(predicate::str::contains("2. Mitosis"));

    studyhub(&db)?
        .args(["flashcards", "delete", "1", "--yes"])
        .assert()
        .success();
    studyhub(&db)?
        .args(["flashcards", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1. Mitosis"))
        .stdout(predicate::str::contains("ATP").not());

    Ok(())
}

#[test]
fn flashcards_reject_blank_and_missing_cards() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    let db = tmp.path().join("db.sqlite");

    studyhub(&db)?
        .args(["flashcards", "add", "--front", "  ", "--back", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
    studyhub(&db)?
        .args(["flashcards", "delete", "3", "--yes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no card at index 3"));

    Ok(())
}

#[test]
fn generation_without_api_key_fails() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    studyhub(&tmp.path().join("db.sqlite"))?
        .args(["flashcards", "generate", "--text", "photosynthesis"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
    Ok(())
}

#[test]
fn mindmap_edits_persist_between_runs() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    let db = tmp.path().join("db.sqlite");
    let output = tmp.path().join("map.mmd");

    studyhub(&db)?
        .args(["mindmap", "branch", "center", "--direction", "left"])
        .assert()
        .success()
        .stdout(predicate::str::contains("node_1"));
    studyhub(&db)?
        .args(["mindmap", "color", "center", "#ff0000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Colored 2 node(s)."));

    studyhub(&db)?
        .args(["mindmap", "mermaid", "--output"])
        .arg(&output)
        .assert()
        .success();
    let mermaid = fs::read_to_string(&output)?;
    assert!(mermaid.starts_with("graph LR"));
    assert!(mermaid.contains("Click to edit"));

    studyhub(&db)?
        .args(["mindmap", "remove", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("node 'missing' not found"));

    Ok(())
}

#[test]
fn unreadable_pdf_import_fails() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    let db = tmp.path().join("db.sqlite");
    let pdf = tmp.path().join("notes.pdf");
    fs::write(&pdf, "not really a pdf")?;

    studyhub(&db)?
        .args(["pages", "import"])
        .arg(&pdf)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open"));

    studyhub(&db)?
        .args(["pages", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pages stored."));
    Ok(())
}

#[test]
fn pages_import_list_and_split() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    let db = tmp.path().join("db.sqlite");
    let pages = tmp.path().join("pages");
    fs::create_dir(&pages)?;
    for idx in 1..=3 {
        fs::write(pages.join(format!("page-{idx}.png")), format!("png-{idx}"))?;
    }

    studyhub(&db)?
        .args(["pages", "import"])
        .arg(&pages)
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported 3 page(s)."));

    studyhub(&db)?
        .args(["pages", "list", "--per-page", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Page 2: image/png"))
        .stdout(predicate::str::contains("View 1 of 2"));

    studyhub(&db)?
        .args(["pages", "split", "1", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Kept 2 page(s)."));

    studyhub(&db)?
        .args(["pages", "delete", "9"])
        .assert()
        .failure();

    studyhub(&db)?
        .args(["pages", "clear", "--yes"])
        .assert()
        .success();
    studyhub(&db)?
        .args(["pages", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pages stored."));

    Ok(())
}

#[test]
fn export_writes_zip() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = tempdir()?;
    let db = tmp.path().join("db.sqlite");
    let output = tmp.path().join("bundle.zip");

    studyhub(&db)?
        .args(["export", "--output"])
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to export."));
    assert!(!output.exists());

    studyhub(&db)?
        .args(["flashcards", "add", "--front", "Q", "--back", "A"])
        .assert()
        .success();
    studyhub(&db)?
        .args(["export", "--output"])
        .arg(&output)
        .assert()
        .success();
    assert!(fs::read(&output)?.starts_with(b"PK"));

    Ok(())
}
