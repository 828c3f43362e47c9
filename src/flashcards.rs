use clap::ValueEnum;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::extract::extract_list;
use crate::gemini::{AiError, CompletionBackend, CompletionRequest, GenerationConfig};
use crate::retry::{RetryPolicy, retry_on_rate_limit};

pub const MIN_CARDS: u32 = 1;
pub const MAX_CARDS: u32 = 10;
pub const DEFAULT_CARDS: u32 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashcardError {
    #[error("both the front and the back of a card are required")]
    MissingText,
    #[error("no card at index {0}")]
    IndexOutOfRange(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

impl Flashcard {
    pub fn new(front: impl Into<String>, back: impl Into<String>) -> Result<Self, FlashcardError> {
        let front = front.into().trim().to_string();
        let back = back.into().trim().to_string();
        if front.is_empty() || back.is_empty() {
            return Err(FlashcardError::MissingText);
        }
        Ok(Self { front, back })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    #[default]
    Mixed,
}

impl Difficulty {
    fn instruction(self) -> &'static str {
        match self {
            Difficulty::Easy => {
                "Write simple, foundational questions that focus on the main concepts."
            }
            Difficulty::Medium => {
                "Write medium-difficulty questions that require understanding how the concepts relate."
            }
            Difficulty::Hard => {
                "Write challenging questions that require deep analysis and full command of the material."
            }
            Difficulty::Mixed => "Mix easy, medium and hard questions.",
        }
    }
}

/// An ordered list of cards, edited in place by index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deck {
    cards: Vec<Flashcard>,
}

impl Deck {
    pub fn new(cards: Vec<Flashcard>) -> Self {
        Self { cards }
    }

    pub fn cards(&self) -> &[Flashcard] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn add(&mut self, front: &str, back: &str) -> Result<usize, FlashcardError> {
        self.cards.push(Flashcard::new(front, back)?);
        Ok(self.cards.len() - 1)
    }

    pub fn extend(&mut self, cards: impl IntoIterator<Item = Flashcard>) {
        self.cards.extend(cards);
    }

    pub fn edit(&mut self, index: usize, front: &str, back: &str) -> Result<(), FlashcardError> {
        let card = Flashcard::new(front, back)?;
        let slot = self
            .cards
            .get_mut(index)
            .ok_or(FlashcardError::IndexOutOfRange(index))?;
        *slot = card;
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> Result<Flashcard, FlashcardError> {
        if index >= self.cards.len() {
            return Err(FlashcardError::IndexOutOfRange(index));
        }
        Ok(self.cards.remove(index))
    }

    pub fn into_cards(self) -> Vec<Flashcard> {
        self.cards
    }
}

/// Walks a copy of a deck one card at a time.
#[derive(Debug, Clone)]
pub struct StudySession {
    cards: Vec<Flashcard>,
    current: usize,
    flipped: bool,
}

impl StudySession {
    pub fn new(cards: &[Flashcard]) -> Self {
        Self {
            cards: cards.to_vec(),
            current: 0,
            flipped: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn position(&self) -> usize {
        self.current
    }

    pub fn is_flipped(&self) -> bool {
        self.flipped
    }

    pub fn current(&self) -> Option<&Flashcard> {
        self.cards.get(self.current)
    }

    /// Text of the visible side of the current card.
    pub fn visible_side(&self) -> Option<&str> {
        self.current().map(|card| {
            if self.flipped {
                card.back.as_str()
            } else {
                card.front.as_str()
            }
        })
    }

    pub fn flip(&mut self) {
        self.flipped = !self.flipped;
    }

    pub fn next(&mut self) {
        if self.cards.is_empty() {
            return;
        }
        self.flipped = false;
        self.current = (self.current + 1) % self.cards.len();
    }

    pub fn previous(&mut self) {
        if self.cards.is_empty() {
            return;
        }
        self.flipped = false;
        self.current = (self.current + self.cards.len() - 1) % self.cards.len();
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.flipped = false;
        self.cards.shuffle(rng);
        self.current = 0;
    }

    /// Removes the current card from the session and returns it. The
    /// position stays put unless it fell off the end.
    pub fn remove_current(&mut self) -> Option<Flashcard> {
        if self.cards.is_empty() {
            return None;
        }
        let removed = self.cards.remove(self.current);
        if self.current >= self.cards.len() {
            self.current = self.cards.len().saturating_sub(1);
        }
        self.flipped = false;
        Some(removed)
    }
}

pub fn build_prompt(text: &str, count: u32, difficulty: Difficulty) -> String {
    format!(
        "Create exactly {count} flashcards from the text below. {instruction}
Guidelines:
1. Write every question and answer in the same language as the input text.
2. Questions must be precise and tied to the key concepts of the text.
3. Answers must be complete and easy to understand.
4. Return only a JSON array in exactly this format, with no extra text or code fences:
[
    {{ \"front\": \"first question\", \"back\": \"first answer\" }},
    {{ \"front\": \"second question\", \"back\": \"second answer\" }}
]

Input text: {text}",
        instruction = difficulty.instruction(),
    )
}

pub fn generation_config() -> GenerationConfig {
    GenerationConfig {
        temperature: 0.7,
        top_p: 0.8,
        top_k: 40,
        max_output_tokens: None,
    }
}

/// Asks the backend for `count` cards about `text`.
pub async fn generate_flashcards<B: CompletionBackend>(
    backend: &B,
    text: &str,
    count: u32,
    difficulty: Difficulty,
) -> Result<Vec<Flashcard>, AiError> {
    if text.trim().is_empty() {
        return Err(AiError::EmptyInput);
    }
    let count = count.clamp(MIN_CARDS, MAX_CARDS);
    let request = CompletionRequest::text(build_prompt(text, count, difficulty), generation_config());

    let response = retry_on_rate_limit(RetryPolicy::default(), || backend.complete(&request)).await?;
    let entries: Vec<Value> = extract_list(&response)?;
    let cards: Vec<Flashcard> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<Flashcard>(entry).ok())
        .filter_map(|card| Flashcard::new(card.front, card.back).ok())
        .collect();

    if cards.is_empty() {
        return Err(AiError::Invalid("no valid flashcards generated".to_string()));
    }
    tracing::info!(requested = count, received = cards.len(), "generated flashcards");
    Ok(cards)
}
