#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use studyhub::{BranchDirection, MindMapEditor};
    use wasm_bindgen_test::*;

    #[wasm_bindgen_test]
    fn test_editor_branch_and_undo() {
        let mut editor = MindMapEditor::default();
        let id = editor
            .add_branch("center", BranchDirection::Left)
            .expect("center node should exist");

        assert!(editor.map().contains_node(&id));
        assert!(editor.undo());
        assert!(!editor.map().contains_node(&id));
    }

    #[wasm_bindgen_test]
    fn test_mermaid_export() {
        let editor = MindMapEditor::default();
        let mermaid = editor.map().to_mermaid();

        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("Click to edit"));
    }
}
