//! Study tools: flashcards, AI and manual mind maps, and a PDF page manager
//! with AI chat.
//!
//! The manual mind-map editor ([`MindMapEditor`]) is the part with real
//! structure; everything else wraps a completion backend or the local
//! SQLite store.

pub mod chat;
pub mod database;
pub mod editor;
pub mod export;
pub mod extract;
pub mod flashcards;
pub mod gemini;
pub mod history;
pub mod mindmap;
pub mod mindmap_ai;
pub mod pages;
pub mod retry;
#[cfg(feature = "server")]
pub mod serve;
pub mod storage;

pub use editor::MindMapEditor;
pub use extract::ExtractError;
pub use flashcards::{Deck, Difficulty, Flashcard, StudySession};
pub use gemini::{AiConfig, AiError, CompletionBackend, CompletionRequest, GeminiClient, GenerationConfig, Part};
pub use history::History;
pub use mindmap::{
    BranchDirection, EdgeStyle, EdgeStylePatch, MarkerKind, MindEdge, MindMap, MindMapError,
    MindNode, NodeKind, Point, Subtree,
};
pub use pages::{PageError, PageImage, PageSet};

/// Tools reachable from the landing page, in display order.
pub const TOOLS: [(&str, &str); 4] = [
    ("flashcards", "Flashcard creator"),
    ("mindmap-ai", "AI mind map"),
    ("mindmap-manual", "Manual mind map"),
    ("pdf-chat", "PDF chat"),
];
