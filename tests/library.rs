use anyhow::Result;
use studyhub::extract::{extract_list, extract_object};
use studyhub::mindmap_ai::GeneratedGraph;
use studyhub::{BranchDirection, Deck, Flashcard, MindMapEditor, PageImage, PageSet};

#[test]
fn editor_builds_and_unwinds_a_map() -> Result<()> {
    let mut editor = MindMapEditor::default();
    let right = editor
        .add_branch("center", BranchDirection::Right)
        .expect("center exists");
    let nested = editor
        .add_branch(&right, BranchDirection::Right)
        .expect("branch exists");
    editor.change_color(&right, "#00aa00")?;

    assert_eq!(editor.map().nodes.len(), 3);
    assert_eq!(editor.map().parent_of(&nested), Some(right.as_str()));

    let removed = editor.delete_node(&right);
    assert_eq!(removed.len(), 2);
    assert_eq!(editor.map().nodes.len(), 1);

    assert!(editor.undo());
    assert_eq!(editor.map().nodes.len(), 3);
    assert!(editor.redo());
    assert_eq!(editor.map().nodes.len(), 1);

    Ok(())
}

#[test]
fn generated_graph_becomes_an_editable_map() -> Result<()> {
    let reply = r#"```json
    {"nodes": [
        {"id": "1", "type": "input", "data": {"label": "Cells"}, "label": "Cells"},
        {"id": "2", "label": "Organelles"},
        {"id": "3", "label": "Membrane"}
    ], "edges": []}
    ```"#;

    let mut graph: GeneratedGraph = extract_object(reply)?;
    graph.ensure_edges();
    let map = graph.into_mind_map();

    assert_eq!(map.nodes.len(), 3);
    assert_eq!(map.edges.len(), 2);
    map.validate()?;
    assert!(map.to_mermaid().contains("Organelles"));

    let editor = MindMapEditor::new(map);
    assert!(!editor.can_undo());
    Ok(())
}

#[test]
fn flashcard_replies_fill_a_deck() -> Result<()> {
    let reply = r#"Here you go:
    [{"front": "What is DNA?", "back": "Genetic material"},
     {"front": "What is RNA?", "back": "Messenger molecule"}]"#;

    let cards: Vec<Flashcard> = extract_list(reply)?;
    let mut deck = Deck::default();
    deck.extend(cards);
    deck.edit(1, "What is mRNA?", "Messenger RNA")?;

    assert_eq!(deck.len(), 2);
    assert_eq!(deck.cards()[1].front, "What is mRNA?");
    Ok(())
}

#[test]
fn page_set_split_keeps_selected_pages() -> Result<()> {
    let pages: Vec<PageImage> = (1..=4)
        .map(|idx| PageImage::from_bytes("image/png", format!("page-{idx}").as_bytes()))
        .collect();
    let mut set = PageSet::new(pages.clone());
    set.toggle_selection(2)?;
    set.toggle_selection(4)?;

    assert_eq!(set.split()?, 2);
    assert_eq!(set.pages(), &[pages[1].clone(), pages[3].clone()]);
    assert!(set.merge(PageSet::default()).is_err());
    Ok(())
}
