//! Question answering over the pages of the current document.
//!
//! A session first analyzes the page images in small groups, then answers
//! questions from that analysis plus a short window of chat history.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::gemini::{AiError, CompletionBackend, CompletionRequest, GenerationConfig};
use crate::pages::{ANALYSIS_GROUP_SIZE, PageImage};
use crate::retry::{RetryPolicy, retry_on_rate_limit};

const GREETING_FIRST: &str = "Hello! What would you like to know about the PDF?";
const GREETING_AGAIN: &str = "What would you like to know about the PDF?";
/// Output cap for every chat call.
pub const CHAT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no PDF pages found")]
    NoPages,
    #[error("please wait until the PDF analysis has finished")]
    NotAnalyzed,
    #[error("question is empty")]
    EmptyQuestion,
    #[error(transparent)]
    Ai(#[from] AiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatConfig {
    pub group_size: usize,
    /// Pause before every group after the first.
    pub group_pause: Duration,
    /// Extra pause after a group fails.
    pub error_pause: Duration,
    pub history_window: usize,
    pub retry: RetryPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            group_size: ANALYSIS_GROUP_SIZE,
            group_pause: Duration::from_secs(2),
            error_pause: Duration::from_secs(5),
            history_window: 6,
            retry: RetryPolicy::default(),
        }
    }
}

impl ChatConfig {
    /// No pauses and no backoff; for tests and local backends.
    pub fn immediate() -> Self {
        Self {
            group_pause: Duration::ZERO,
            error_pause: Duration::ZERO,
            retry: RetryPolicy::immediate(1),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    Greeting,
    Document,
    History,
    Unrelated,
}

impl QuestionKind {
    /// Reads the model's 1-4 answer. Anything unreadable counts as a
    /// document question so it still gets a real answer.
    pub fn from_response(text: &str) -> Self {
        match text.trim().chars().find(|ch| ch.is_ascii_digit()) {
            Some('1') => QuestionKind::Greeting,
            Some('3') => QuestionKind::History,
            Some('4') => QuestionKind::Unrelated,
            _ => QuestionKind::Document,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub topic: String,
    pub page_count: usize,
    pub text: String,
    /// First and last page number of every group that could not be analyzed.
    pub failed_groups: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub kind: QuestionKind,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    config: ChatConfig,
    analysis: Option<Analysis>,
    history: Vec<String>,
    messages: Vec<ChatMessage>,
    web_search: bool,
}

impl ChatSession {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// An empty session with the same settings.
    pub fn fresh(&self) -> Self {
        Self {
            web_search: self.web_search,
            ..Self::new(self.config)
        }
    }

    pub fn analysis(&self) -> Option<&Analysis> {
        self.analysis.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.analysis.is_some()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn web_search(&self) -> bool {
        self.web_search
    }

    pub fn set_web_search(&mut self, enabled: bool) {
        self.web_search = enabled;
    }

    /// Detects the topic from the first page, then analyzes the pages group
    /// by group. A failed group leaves a placeholder line and the rest keep
    /// going. `progress` receives the last analyzed page and the total.
    pub async fn analyze<B: CompletionBackend>(
        &mut self,
        backend: &B,
        pages: &[PageImage],
        mut progress: impl FnMut(usize, usize),
    ) -> Result<&Analysis, ChatError> {
        let first = pages.first().ok_or(ChatError::NoPages)?;
        self.analysis = None;
        self.history.clear();
        self.messages.clear();

        let topic_request = CompletionRequest::text(
            "Analyze this image and name the main topic or subject of this document or chapter. Return ONLY the topic name, nothing else.",
            generation_config(),
        )
        .with_part(first.to_part());
        let topic = self.call(backend, &topic_request).await?.trim().to_string();
        tracing::info!(topic = %topic, pages = pages.len(), "starting document analysis");

        let total = pages.len();
        let size = self.config.group_size.max(1);
        let mut text = String::new();
        let mut failed_groups = Vec::new();

        for (idx, group) in pages.chunks(size).enumerate() {
            let start = idx * size + 1;
            let end = start + group.len() - 1;
            if idx > 0 {
                tokio::time::sleep(self.config.group_pause).await;
            }

            let mut request = CompletionRequest::text(
                format!(
                    "Analyze pages {start} to {end} of this PDF document. Do not use any asterisks (*) in your response."
                ),
                generation_config(),
            );
            for page in group {
                request = request.with_part(page.to_part());
            }

            match self.call(backend, &request).await {
                Ok(analysis) => {
                    text.push_str(&format!(
                        "\n\nPages {start}-{end} Analysis:\n{}",
                        strip_asterisks(&analysis)
                    ));
                }
                Err(err) => {
                    tracing::warn!(error = %err, start, end, "failed to analyze page group");
                    text.push_str(&format!("\n\nPages {start}-{end}: Error analyzing these pages."));
                    failed_groups.push((start, end));
                    tokio::time::sleep(self.config.error_pause).await;
                }
            }
            progress(end, total);
        }

        self.messages.push(ChatMessage {
            sender: Sender::Ai,
            text: format!("PDF analysis finished. All {total} pages were analyzed. You can ask your questions now."),
        });
        Ok(self.analysis.insert(Analysis {
            topic,
            page_count: total,
            text,
            failed_groups,
        }))
    }

    /// Classifies `question` and answers it. Greetings and unrelated
    /// questions get a fixed reply without a second model call.
    pub async fn ask<B: CompletionBackend>(
        &mut self,
        backend: &B,
        question: &str,
    ) -> Result<Answer, ChatError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ChatError::EmptyQuestion);
        }
        let Some(analysis) = self.analysis.clone() else {
            return Err(ChatError::NotAnalyzed);
        };

        let first_exchange = self.history.is_empty();
        self.messages.push(ChatMessage {
            sender: Sender::User,
            text: question.to_string(),
        });
        self.history.push(format!("User: {question}"));
        let history = self.recent_history();

        let classify = CompletionRequest::text(
            build_classification_prompt(&analysis.topic, &history, question),
            generation_config(),
        );
        let kind = QuestionKind::from_response(&self.call(backend, &classify).await?);

        let text = match kind {
            QuestionKind::Greeting if first_exchange => GREETING_FIRST.to_string(),
            QuestionKind::Greeting => GREETING_AGAIN.to_string(),
            QuestionKind::Unrelated => format!(
                "Please ask a question about the PDF content on {}.",
                analysis.topic
            ),
            QuestionKind::Document | QuestionKind::History => {
                let request = CompletionRequest::text(
                    build_answer_prompt(&analysis.text, &history, question, self.web_search),
                    generation_config(),
                );
                let answer = strip_asterisks(&self.call(backend, &request).await?);
                self.history.push(format!("Assistant: {answer}"));
                answer
            }
        };

        self.messages.push(ChatMessage {
            sender: Sender::Ai,
            text: text.clone(),
        });
        Ok(Answer { kind, text })
    }

    fn recent_history(&self) -> String {
        let skip = self.history.len().saturating_sub(self.config.history_window);
        self.history[skip..].join("\n")
    }

    async fn call<B: CompletionBackend>(
        &self,
        backend: &B,
        request: &CompletionRequest,
    ) -> Result<String, AiError> {
        retry_on_rate_limit(self.config.retry, || backend.complete(request)).await
    }
}

pub fn generation_config() -> GenerationConfig {
    GenerationConfig::default().with_max_tokens(CHAT_MAX_TOKENS)
}

pub fn strip_asterisks(text: &str) -> String {
    text.replace('*', "")
}

pub fn build_classification_prompt(topic: &str, history: &str, question: &str) -> String {
    format!(
        "PDF Topic: {topic}
Chat History:
{history}
User Question: \"{question}\"

Is this question:
1. A greeting (like hello, hi, etc.)
2. Related to the PDF content about {topic}
3. About the previous messages in chat history (like asking for translation, clarification, etc.)
4. Completely unrelated to both PDF and chat history

Return ONLY the number (1, 2, 3, or 4)."
    )
}

pub fn build_answer_prompt(context: &str, history: &str, question: &str, web_search: bool) -> String {
    let web_mode = if web_search {
        "ENABLED: include both PDF content and web knowledge, with at least one [web] citation"
    } else {
        "DISABLED: use ONLY the PDF content, never web information"
    };
    format!(
        "Context from PDF analysis:
{context}

Chat History:
{history}

Current question: {question}

Instructions:
1. Respond in the same language as the question.
2. If the question is about a previous question or answer, use the chat history above.
3. Web search mode: {web_mode}.
4. Cite PDF content with [p.X] after each piece of information and web information with [web].
5. Do not use any asterisks (*) in your response.
6. Refer to the material as \"the PDF\"."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers by prompt shape and records every prompt it saw.
    struct Scripted {
        classification: &'static str,
        fail_group_starting_at: Option<usize>,
        prompts: Mutex<Vec<String>>,
        token_caps: Mutex<Vec<Option<u32>>>,
    }

    impl Scripted {
        fn new(classification: &'static str) -> Self {
            Self {
                classification,
                fail_group_starting_at: None,
                prompts: Mutex::new(Vec::new()),
                token_caps: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl CompletionBackend for Scripted {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, AiError> {
            let prompt = request.prompt_text();
            self.prompts.lock().unwrap().push(prompt.clone());
            self.token_caps
                .lock()
                .unwrap()
                .push(request.config.max_output_tokens);
            if prompt.contains("main topic") {
                return Ok(" Photosynthesis \n".to_string());
            }
            if let Some(start) = self.fail_group_starting_at {
                if prompt.contains(&format!("pages {start} to")) {
                    return Err(AiError::Api {
                        status: 500,
                        message: "boom".into(),
                    });
                }
            }
            if prompt.starts_with("Analyze pages") {
                return Ok("**Light** reactions".to_string());
            }
            if prompt.contains("Return ONLY the number") {
                return Ok(self.classification.to_string());
            }
            Ok("Chlorophyll *absorbs* light [p.1]".to_string())
        }
    }

    fn pages(n: u8) -> Vec<PageImage> {
        (0..n).map(|i| PageImage::from_bytes("image/png", &[i])).collect()
    }

    #[test]
    fn classification_reads_first_digit() {
        assert_eq!(QuestionKind::from_response(" 1\n"), QuestionKind::Greeting);
        assert_eq!(QuestionKind::from_response("Answer: 4"), QuestionKind::Unrelated);
        assert_eq!(QuestionKind::from_response("3"), QuestionKind::History);
        assert_eq!(QuestionKind::from_response("not sure"), QuestionKind::Document);
    }

    #[tokio::test]
    async fn analysis_groups_pages_and_strips_asterisks() {
        let backend = Scripted::new("2");
        let mut session = ChatSession::new(ChatConfig::immediate());
        let mut seen = Vec::new();
        let analysis = session
            .analyze(&backend, &pages(7), |done, total| seen.push((done, total)))
            .await
            .unwrap();

        assert_eq!(analysis.topic, "Photosynthesis");
        assert!(analysis.text.contains("Pages 1-5 Analysis:\nLight reactions"));
        assert!(analysis.text.contains("Pages 6-7 Analysis:"));
        assert!(!analysis.text.contains('*'));
        assert_eq!(seen, vec![(5, 7), (7, 7)]);
    }

    #[tokio::test]
    async fn failed_group_leaves_placeholder() {
        let mut backend = Scripted::new("2");
        backend.fail_group_starting_at = Some(6);
        let mut session = ChatSession::new(ChatConfig::immediate());
        let analysis = session.analyze(&backend, &pages(12), |_, _| {}).await.unwrap();

        assert!(analysis.text.contains("Pages 6-10: Error analyzing these pages."));
        assert!(analysis.text.contains("Pages 11-12 Analysis:"));
        assert_eq!(analysis.failed_groups, vec![(6, 10)]);
    }

    #[tokio::test]
    async fn asking_before_analysis_fails() {
        let backend = Scripted::new("2");
        let mut session = ChatSession::new(ChatConfig::immediate());
        assert!(matches!(
            session.ask(&backend, "what is this?").await,
            Err(ChatError::NotAnalyzed)
        ));
        assert!(matches!(
            session.analyze(&backend, &[], |_, _| {}).await,
            Err(ChatError::NoPages)
        ));
    }

    #[tokio::test]
    async fn document_question_gets_cited_answer() {
        let backend = Scripted::new("2");
        let mut session = ChatSession::new(ChatConfig::immediate());
        session.analyze(&backend, &pages(2), |_, _| {}).await.unwrap();
        session.set_web_search(true);

        let answer = session.ask(&backend, "What absorbs light?").await.unwrap();
        assert_eq!(answer.kind, QuestionKind::Document);
        assert_eq!(answer.text, "Chlorophyll absorbs light [p.1]");

        let prompts = backend.prompts();
        let last = prompts.last().unwrap();
        assert!(last.contains("Web search mode: ENABLED"));
        assert!(last.contains("User: What absorbs light?"));
    }

    #[tokio::test]
    async fn greetings_and_unrelated_skip_the_answer_call() {
        let backend = Scripted::new("1");
        let mut session = ChatSession::new(ChatConfig::immediate());
        session.analyze(&backend, &pages(1), |_, _| {}).await.unwrap();
        let before = backend.prompts().len();

        let answer = session.ask(&backend, "hi").await.unwrap();
        assert_eq!(answer.text, GREETING_FIRST);
        let again = session.ask(&backend, "hello").await.unwrap();
        assert_eq!(again.text, GREETING_AGAIN);
        assert_eq!(backend.prompts().len(), before + 2);

        let backend = Scripted::new("4");
        let mut session = ChatSession::new(ChatConfig::immediate());
        session.analyze(&backend, &pages(1), |_, _| {}).await.unwrap();
        let answer = session.ask(&backend, "football scores?").await.unwrap();
        assert_eq!(answer.text, "Please ask a question about the PDF content on Photosynthesis.");
    }

    #[tokio::test]
    async fn history_window_keeps_last_six_lines() {
        let backend = Scripted::new("3");
        let mut session = ChatSession::new(ChatConfig::immediate());
        session.analyze(&backend, &pages(1), |_, _| {}).await.unwrap();
        for i in 0..5 {
            session.ask(&backend, &format!("question {i}")).await.unwrap();
        }
        let prompts = backend.prompts();
        let last = prompts.last().unwrap();
        assert!(!last.contains("question 1"));
        assert!(last.contains("User: question 2"));
        assert!(last.contains("User: question 4"));
    }

    #[tokio::test]
    async fn every_chat_call_is_capped() {
        let backend = Scripted::new("2");
        let mut session = ChatSession::new(ChatConfig::immediate());
        session.analyze(&backend, &pages(6), |_, _| {}).await.unwrap();
        session.ask(&backend, "What absorbs light?").await.unwrap();

        let caps = backend.token_caps.lock().unwrap().clone();
        assert_eq!(caps.len(), 5);
        assert!(caps.iter().all(|cap| *cap == Some(CHAT_MAX_TOKENS)));
    }

    #[tokio::test]
    async fn fresh_session_keeps_settings_only() {
        let backend = Scripted::new("2");
        let mut session = ChatSession::new(ChatConfig::immediate());
        session.set_web_search(true);
        session.analyze(&backend, &pages(1), |_, _| {}).await.unwrap();
        assert!(session.is_ready());

        let fresh = session.fresh();
        assert!(!fresh.is_ready());
        assert!(fresh.web_search());
        assert!(fresh.messages().is_empty());
    }
}
