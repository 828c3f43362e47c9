use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;

use crate::chat::{Analysis, Answer, ChatConfig, ChatError, ChatMessage, ChatSession};
use crate::database::Database;
use crate::flashcards::{self, DEFAULT_CARDS, Difficulty, Flashcard, FlashcardError};
use crate::gemini::{AiConfig, AiError, CompletionBackend, GeminiClient};
use crate::mindmap::{BranchDirection, EdgeStylePatch, MindEdge, MindMap, MindMapError, MindNode, Point};
use crate::pages::{DEFAULT_PAGES_PER_VIEW, PageError, PageImage, PageRenderer, PageSet, PdfRenderer};
use crate::{MindMapEditor, TOOLS, mindmap_ai, storage};

/// Arguments for running the studyhub web server
#[derive(Debug, Clone, Parser)]
#[command(name = "studyhub serve", about = "Start the studyhub HTTP API server.")]
pub struct ServeArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 5151)]
    pub port: u16,

    /// API key for the completion endpoint (defaults to GEMINI_API_KEY).
    #[arg(long = "api-key")]
    pub api_key: Option<String>,

    /// Model name (defaults to STUDYHUB_MODEL or gemini-2.0-flash-exp).
    #[arg(long)]
    pub model: Option<String>,

    /// Base URL of the completion endpoint.
    #[arg(long = "api-url")]
    pub api_url: Option<String>,
}

/// A completion backend that can be shared across request handlers.
pub trait SharedBackend: CompletionBackend + Send + Sync + 'static {}

impl<T: CompletionBackend + Send + Sync + 'static> SharedBackend for T {}

pub struct ServeState<B> {
    db: Database,
    editor: RwLock<MindMapEditor>,
    chat: Mutex<ChatSession>,
    analyzing: AtomicBool,
    ai: Option<B>,
}

/// Clears the analysis flag when the running analysis finishes or fails.
struct AnalysisGuard<'a>(&'a AtomicBool);

impl Drop for AnalysisGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<B: SharedBackend> ServeState<B> {
    /// Loads the saved mind map, or starts from a fresh one.
    pub async fn new(db: Database, ai: Option<B>, chat: ChatConfig) -> Result<Self> {
        let map = storage::load_mindmap(db.pool(), storage::DEFAULT_MINDMAP)
            .await?
            .unwrap_or_default();
        Ok(Self {
            db,
            editor: RwLock::new(MindMapEditor::new(map)),
            chat: Mutex::new(ChatSession::new(chat)),
            analyzing: AtomicBool::new(false),
            ai,
        })
    }

    fn is_analyzing(&self) -> bool {
        self.analyzing.load(Ordering::Acquire)
    }

    fn backend(&self) -> ApiResult<&B> {
        self.ai.as_ref().ok_or_else(|| ai_error(AiError::MissingApiKey))
    }

    async fn persist_map(&self, map: &MindMap) -> ApiResult<()> {
        storage::save_mindmap(self.db.pool(), storage::DEFAULT_MINDMAP, map)
            .await
            .map_err(internal_error)
    }

    /// Runs `edit` under the write lock, saves the result and returns the
    /// new editor payload together with `edit`'s own output.
    async fn edit_map<T>(
        &self,
        edit: impl FnOnce(&mut MindMapEditor) -> ApiResult<T>,
    ) -> ApiResult<(T, MindMapPayload)> {
        let mut editor = self.editor.write().await;
        let output = edit(&mut *editor)?;
        self.persist_map(editor.map()).await?;
        Ok((output, MindMapPayload::from_editor(&editor)))
    }
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

const MAX_PDF_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolPayload {
    id: &'static str,
    name: &'static str,
    path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MindMapPayload {
    nodes: Vec<MindNode>,
    edges: Vec<MindEdge>,
    can_undo: bool,
    can_redo: bool,
}

impl MindMapPayload {
    fn from_editor(editor: &MindMapEditor) -> Self {
        Self {
            nodes: editor.map().nodes.clone(),
            edges: editor.map().edges.clone(),
            can_undo: editor.can_undo(),
            can_redo: editor.can_redo(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatedPayload {
    id: String,
    map: MindMapPayload,
}

#[derive(Debug, Serialize)]
struct DeletedPayload {
    deleted: Vec<String>,
    map: MindMapPayload,
}

#[derive(Debug, Deserialize)]
struct BranchRequest {
    parent: String,
    direction: BranchDirection,
}

#[derive(Debug, Deserialize)]
struct ColorRequest {
    color: String,
}

#[derive(Debug, Deserialize)]
struct LabelRequest {
    label: String,
}

#[derive(Debug, Deserialize)]
struct SelectionRequest {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    source: String,
    target: String,
}

#[derive(Debug, Deserialize)]
struct TextRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct MermaidPayload {
    mermaid: String,
}

#[derive(Debug, Deserialize)]
struct CardRequest {
    front: String,
    back: String,
}

#[derive(Debug, Deserialize)]
struct GenerateCardsRequest {
    text: String,
    #[serde(default)]
    count: Option<u32>,
    #[serde(default)]
    difficulty: Difficulty,
}

#[derive(Debug, Serialize)]
struct DeckPayload {
    cards: Vec<Flashcard>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    view: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PagesPayload {
    total: usize,
    view: usize,
    per_page: usize,
    view_count: usize,
    pages: Vec<PageImage>,
}

#[derive(Debug, Deserialize)]
struct StorePagesRequest {
    pages: Vec<PageImage>,
}

#[derive(Debug, Deserialize)]
struct PageNumbersRequest {
    pages: Vec<usize>,
}

#[derive(Debug, Serialize)]
struct PageCountPayload {
    total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatPayload {
    ready: bool,
    analyzing: bool,
    web_search: bool,
    topic: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AskRequest {
    question: String,
    #[serde(default)]
    web_search: bool,
}

pub fn router<B: SharedBackend>(state: Arc<ServeState<B>>) -> Router {
    Router::new()
        .route("/", get(get_tools))
        .route("/api/mindmap", get(get_mindmap::<B>).put(put_mindmap::<B>))
        .route("/api/mindmap/mermaid", get(get_mermaid::<B>))
        .route("/api/mindmap/branches", post(post_branch::<B>))
        .route("/api/mindmap/nodes/:id", axum::routing::delete(delete_node::<B>))
        .route("/api/mindmap/nodes/:id/color", put(put_color::<B>))
        .route("/api/mindmap/nodes/:id/label", put(put_label::<B>))
        .route("/api/mindmap/nodes/:id/position", put(put_position::<B>))
        .route("/api/mindmap/selection", put(put_selection::<B>))
        .route("/api/mindmap/selection/delete", post(delete_selection::<B>))
        .route("/api/mindmap/edges", post(post_edge::<B>))
        .route("/api/mindmap/edges/:id/style", put(put_edge_style::<B>))
        .route("/api/mindmap/undo", post(post_undo::<B>))
        .route("/api/mindmap/redo", post(post_redo::<B>))
        .route("/api/mindmap/generate", post(generate_mindmap::<B>))
        .route("/api/mindmap/generate/mermaid", post(generate_mermaid::<B>))
        .route("/api/flashcards", get(get_flashcards::<B>).post(post_flashcard::<B>))
        .route(
            "/api/flashcards/:index",
            put(put_flashcard::<B>).delete(delete_flashcard::<B>),
        )
        .route("/api/flashcards/generate", post(generate_flashcards::<B>))
        .route(
            "/api/pages",
            get(get_pages::<B>).put(put_pages::<B>).delete(delete_pages::<B>),
        )
        .route(
            "/api/pages/import",
            post(import_pdf::<B>).layer(DefaultBodyLimit::max(MAX_PDF_BYTES)),
        )
        .route("/api/pages/delete", post(delete_page_numbers::<B>))
        .route("/api/pages/split", post(split_pages::<B>))
        .route("/api/pages/merge", post(merge_pages::<B>))
        .route("/api/chat", get(get_chat::<B>))
        .route("/api/chat/analyze", post(analyze_pages::<B>))
        .route("/api/chat/ask", post(ask_question::<B>))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = AiConfig::from_env().with_overrides(args.api_key, args.model, args.api_url);
    let ai = match GeminiClient::new(&config) {
        Ok(client) => {
            tracing::info!(model = client.model(), "AI routes enabled");
            Some(client)
        }
        Err(err) => {
            tracing::warn!(error = %err, "AI routes disabled");
            None
        }
    };

    let db = Database::open_default().await?;
    let state = Arc::new(ServeState::new(db, ai, ChatConfig::default()).await?);
    let app = router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP server to {addr}"))?;

    tracing::info!(%addr, "server started");
    println!("studyhub server listening on http://{addr}");
    println!("Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn get_tools() -> Json<Vec<ToolPayload>> {
    Json(
        TOOLS
            .iter()
            .map(|&(id, name)| ToolPayload {
                id,
                name,
                path: format!("/{id}"),
            })
            .collect(),
    )
}

async fn get_mindmap<B: SharedBackend>(State(state): State<Arc<ServeState<B>>>) -> Json<MindMapPayload> {
    Json(MindMapPayload::from_editor(&*state.editor.read().await))
}

async fn put_mindmap<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(map): Json<MindMap>,
) -> ApiResult<Json<MindMapPayload>> {
    let ((), payload) = state
        .edit_map(|editor| {
            editor
                .replace(map)
                .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))
        })
        .await?;
    Ok(Json(payload))
}

async fn get_mermaid<B: SharedBackend>(State(state): State<Arc<ServeState<B>>>) -> Response {
    let definition = state.editor.read().await.map().to_mermaid();
    let mut response = Response::new(definition.into());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

async fn post_branch<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<BranchRequest>,
) -> ApiResult<impl IntoResponse> {
    let (id, map) = state
        .edit_map(|editor| {
            editor
                .add_branch(&request.parent, request.direction)
                .ok_or_else(|| {
                    (
                        StatusCode::NOT_FOUND,
                        format!("node '{}' not found", request.parent),
                    )
                })
        })
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedPayload { id, map })))
}

async fn delete_node<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    AxumPath(node_id): AxumPath<String>,
) -> ApiResult<Json<DeletedPayload>> {
    let (deleted, map) = state
        .edit_map(|editor| {
            let removed = editor.delete_node(&node_id);
            if removed.is_empty() {
                return Err((StatusCode::NOT_FOUND, format!("node '{node_id}' not found")));
            }
            Ok(sorted(removed))
        })
        .await?;
    Ok(Json(DeletedPayload { deleted, map }))
}

async fn put_color<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    AxumPath(node_id): AxumPath<String>,
    Json(request): Json<ColorRequest>,
) -> ApiResult<Json<MindMapPayload>> {
    let (_, payload) = state
        .edit_map(|editor| {
            editor
                .change_color(&node_id, &request.color)
                .map_err(mindmap_error)
        })
        .await?;
    Ok(Json(payload))
}

async fn put_label<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    AxumPath(node_id): AxumPath<String>,
    Json(request): Json<LabelRequest>,
) -> ApiResult<Json<MindMapPayload>> {
    let ((), payload) = state
        .edit_map(|editor| editor.rename(&node_id, &request.label).map_err(mindmap_error))
        .await?;
    Ok(Json(payload))
}

async fn put_position<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    AxumPath(node_id): AxumPath<String>,
    Json(position): Json<Point>,
) -> ApiResult<Json<MindMapPayload>> {
    let ((), payload) = state
        .edit_map(|editor| editor.move_node(&node_id, position).map_err(mindmap_error))
        .await?;
    Ok(Json(payload))
}

async fn put_selection<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<SelectionRequest>,
) -> ApiResult<Json<MindMapPayload>> {
    let ((), payload) = state
        .edit_map(|editor| {
            editor.set_selected(request.ids.iter().map(String::as_str));
            Ok(())
        })
        .await?;
    Ok(Json(payload))
}

async fn delete_selection<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
) -> ApiResult<Json<DeletedPayload>> {
    let (deleted, map) = state
        .edit_map(|editor| Ok(sorted(editor.delete_selected())))
        .await?;
    Ok(Json(DeletedPayload { deleted, map }))
}

async fn post_edge<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<impl IntoResponse> {
    let (id, map) = state
        .edit_map(|editor| {
            editor
                .connect(&request.source, &request.target)
                .map_err(mindmap_error)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedPayload { id, map })))
}

async fn put_edge_style<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    AxumPath(edge_id): AxumPath<String>,
    Json(patch): Json<EdgeStylePatch>,
) -> ApiResult<Json<MindMapPayload>> {
    let ((), payload) = state
        .edit_map(|editor| editor.update_edge_style(&edge_id, &patch).map_err(mindmap_error))
        .await?;
    Ok(Json(payload))
}

async fn post_undo<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
) -> ApiResult<Json<MindMapPayload>> {
    let ((), payload) = state
        .edit_map(|editor| {
            if editor.undo() {
                Ok(())
            } else {
                Err((StatusCode::CONFLICT, "nothing to undo".to_string()))
            }
        })
        .await?;
    Ok(Json(payload))
}

async fn post_redo<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
) -> ApiResult<Json<MindMapPayload>> {
    let ((), payload) = state
        .edit_map(|editor| {
            if editor.redo() {
                Ok(())
            } else {
                Err((StatusCode::CONFLICT, "nothing to redo".to_string()))
            }
        })
        .await?;
    Ok(Json(payload))
}

async fn generate_mindmap<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<TextRequest>,
) -> ApiResult<Json<MindMapPayload>> {
    let graph = mindmap_ai::generate_graph(state.backend()?, &request.text)
        .await
        .map_err(ai_error)?;
    let map = graph.into_mind_map();
    let ((), payload) = state
        .edit_map(|editor| editor.replace(map).map_err(mindmap_error))
        .await?;
    Ok(Json(payload))
}

async fn generate_mermaid<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<TextRequest>,
) -> ApiResult<Json<MermaidPayload>> {
    let mermaid = mindmap_ai::generate_mermaid(state.backend()?, &request.text)
        .await
        .map_err(ai_error)?;
    Ok(Json(MermaidPayload { mermaid }))
}

async fn get_flashcards<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
) -> ApiResult<Json<DeckPayload>> {
    let deck = storage::load_deck(state.db.pool())
        .await
        .map_err(internal_error)?;
    Ok(Json(DeckPayload {
        cards: deck.into_cards(),
    }))
}

async fn post_flashcard<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<CardRequest>,
) -> ApiResult<impl IntoResponse> {
    let pool = state.db.pool();
    let mut deck = storage::load_deck(pool).await.map_err(internal_error)?;
    deck.add(&request.front, &request.back)
        .map_err(flashcard_error)?;
    storage::save_deck(pool, &deck).await.map_err(internal_error)?;
    Ok((
        StatusCode::CREATED,
        Json(DeckPayload {
            cards: deck.into_cards(),
        }),
    ))
}

async fn put_flashcard<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    AxumPath(index): AxumPath<usize>,
    Json(request): Json<CardRequest>,
) -> ApiResult<Json<DeckPayload>> {
    let pool = state.db.pool();
    let mut deck = storage::load_deck(pool).await.map_err(internal_error)?;
    deck.edit(index, &request.front, &request.back)
        .map_err(flashcard_error)?;
    storage::save_deck(pool, &deck).await.map_err(internal_error)?;
    Ok(Json(DeckPayload {
        cards: deck.into_cards(),
    }))
}

async fn delete_flashcard<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    AxumPath(index): AxumPath<usize>,
) -> ApiResult<Json<DeckPayload>> {
    let pool = state.db.pool();
    let mut deck = storage::load_deck(pool).await.map_err(internal_error)?;
    deck.delete(index).map_err(flashcard_error)?;
    storage::save_deck(pool, &deck).await.map_err(internal_error)?;
    Ok(Json(DeckPayload {
        cards: deck.into_cards(),
    }))
}

async fn generate_flashcards<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<GenerateCardsRequest>,
) -> ApiResult<Json<DeckPayload>> {
    let cards = flashcards::generate_flashcards(
        state.backend()?,
        &request.text,
        request.count.unwrap_or(DEFAULT_CARDS),
        request.difficulty,
    )
    .await
    .map_err(ai_error)?;

    let pool = state.db.pool();
    let mut deck = storage::load_deck(pool).await.map_err(internal_error)?;
    deck.extend(cards.iter().cloned());
    storage::save_deck(pool, &deck).await.map_err(internal_error)?;
    Ok(Json(DeckPayload { cards }))
}

async fn get_pages<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<PagesPayload>> {
    let set = load_page_set(&state).await?;
    let view = query.view.unwrap_or(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PAGES_PER_VIEW);
    Ok(Json(PagesPayload {
        total: set.len(),
        view,
        per_page,
        view_count: set.view_count(per_page),
        pages: set.page(view, per_page).to_vec(),
    }))
}

async fn put_pages<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<StorePagesRequest>,
) -> ApiResult<Json<PageCountPayload>> {
    storage::store_pages(state.db.pool(), &request.pages)
        .await
        .map_err(internal_error)?;
    Ok(Json(PageCountPayload {
        total: request.pages.len(),
    }))
}

/// Renders an uploaded PDF and stores it as the current document.
async fn import_pdf<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    body: Bytes,
) -> ApiResult<Json<PageCountPayload>> {
    let (file, pages) = tokio::task::spawn_blocking(move || {
        let renderer = PdfRenderer::from_bytes(body.to_vec())?;
        let pages = (0..renderer.page_count())
            .map(|index| renderer.render_page(index))
            .collect::<Result<Vec<_>, PageError>>()?;
        Ok::<_, PageError>((renderer.into_bytes(), pages))
    })
    .await
    .map_err(|err| internal_error(err.into()))?
    .map_err(page_error)?;

    let pool = state.db.pool();
    storage::store_pages(pool, &pages).await.map_err(internal_error)?;
    storage::store_file(pool, &file).await.map_err(internal_error)?;
    tracing::info!(pages = pages.len(), "imported PDF upload");
    Ok(Json(PageCountPayload { total: pages.len() }))
}

async fn delete_pages<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
) -> ApiResult<StatusCode> {
    storage::clear_document(state.db.pool())
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_page_numbers<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<PageNumbersRequest>,
) -> ApiResult<Json<PageCountPayload>> {
    let mut set = selected_page_set(&state, &request.pages).await?;
    set.delete_selected().map_err(page_error)?;
    save_page_set(&state, set).await
}

async fn split_pages<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<PageNumbersRequest>,
) -> ApiResult<Json<PageCountPayload>> {
    let mut set = selected_page_set(&state, &request.pages).await?;
    set.split().map_err(page_error)?;
    save_page_set(&state, set).await
}

async fn merge_pages<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<StorePagesRequest>,
) -> ApiResult<Json<PageCountPayload>> {
    let mut set = load_page_set(&state).await?;
    set.merge(PageSet::new(request.pages)).map_err(page_error)?;
    save_page_set(&state, set).await
}

async fn get_chat<B: SharedBackend>(State(state): State<Arc<ServeState<B>>>) -> Json<ChatPayload> {
    let chat = state.chat.lock().await;
    Json(ChatPayload {
        ready: chat.is_ready(),
        analyzing: state.is_analyzing(),
        web_search: chat.web_search(),
        topic: chat.analysis().map(|analysis| analysis.topic.clone()),
        messages: chat.messages().to_vec(),
    })
}

/// Analyzes the stored pages in a detached session so the chat lock is
/// only held to swap sessions. Questions asked meanwhile get a conflict.
async fn analyze_pages<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
) -> ApiResult<Json<Analysis>> {
    let backend = state.backend()?;
    let pages = storage::retrieve_pages(state.db.pool())
        .await
        .map_err(internal_error)?;
    if pages.is_empty() {
        return Err(chat_error(ChatError::NoPages));
    }
    if state
        .analyzing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(analysis_running());
    }
    let _guard = AnalysisGuard(&state.analyzing);

    let mut session = {
        let mut chat = state.chat.lock().await;
        let session = chat.fresh();
        *chat = chat.fresh();
        session
    };
    let analysis = session
        .analyze(backend, &pages, |done, total| {
            tracing::info!(done, total, "analyzed pages");
        })
        .await
        .map_err(chat_error)?
        .clone();
    *state.chat.lock().await = session;
    Ok(Json(analysis))
}

async fn ask_question<B: SharedBackend>(
    State(state): State<Arc<ServeState<B>>>,
    Json(request): Json<AskRequest>,
) -> ApiResult<Json<Answer>> {
    let backend = state.backend()?;
    if state.is_analyzing() {
        return Err(analysis_running());
    }
    let mut chat = state.chat.lock().await;
    chat.set_web_search(request.web_search);
    let answer = chat
        .ask(backend, &request.question)
        .await
        .map_err(chat_error)?;
    Ok(Json(answer))
}

async fn load_page_set<B: SharedBackend>(state: &ServeState<B>) -> ApiResult<PageSet> {
    let pages = storage::retrieve_pages(state.db.pool())
        .await
        .map_err(internal_error)?;
    Ok(PageSet::new(pages))
}

async fn selected_page_set<B: SharedBackend>(
    state: &ServeState<B>,
    numbers: &[usize],
) -> ApiResult<PageSet> {
    let mut set = load_page_set(state).await?;
    for number in numbers.iter().copied().collect::<BTreeSet<_>>() {
        set.toggle_selection(number).map_err(page_error)?;
    }
    Ok(set)
}

async fn save_page_set<B: SharedBackend>(
    state: &ServeState<B>,
    set: PageSet,
) -> ApiResult<Json<PageCountPayload>> {
    let total = set.len();
    storage::store_pages(state.db.pool(), set.pages())
        .await
        .map_err(internal_error)?;
    Ok(Json(PageCountPayload { total }))
}

fn sorted(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut ids: Vec<String> = ids.into_iter().collect();
    ids.sort();
    ids
}

fn internal_error(err: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

fn mindmap_error(err: MindMapError) -> (StatusCode, String) {
    let status = match err {
        MindMapError::NodeNotFound(_) | MindMapError::EdgeNotFound(_) => StatusCode::NOT_FOUND,
        MindMapError::TargetAlreadyConnected(_) => StatusCode::CONFLICT,
        MindMapError::SelfLoop(_)
        | MindMapError::CenterAsTarget
        | MindMapError::DuplicateNode(_)
        | MindMapError::DuplicateEdge(_)
        | MindMapError::DanglingEdge(_)
        | MindMapError::CenterCount(_) => StatusCode::BAD_REQUEST,
    };
    (status, err.to_string())
}

fn analysis_running() -> (StatusCode, String) {
    (StatusCode::CONFLICT, "PDF analysis is still running".to_string())
}

fn flashcard_error(err: FlashcardError) -> (StatusCode, String) {
    let status = match err {
        FlashcardError::MissingText => StatusCode::BAD_REQUEST,
        FlashcardError::IndexOutOfRange(_) => StatusCode::NOT_FOUND,
    };
    (status, err.to_string())
}

fn page_error(err: PageError) -> (StatusCode, String) {
    let status = match err {
        PageError::MergeUnsupported => StatusCode::NOT_IMPLEMENTED,
        PageError::PageOutOfRange(_) | PageError::NothingSelected | PageError::InvalidDataUrl => {
            StatusCode::BAD_REQUEST
        }
        PageError::Pdf(_) | PageError::NoPages(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn ai_error(err: AiError) -> (StatusCode, String) {
    let status = match err {
        AiError::MissingApiKey => StatusCode::SERVICE_UNAVAILABLE,
        AiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        AiError::EmptyInput => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string())
}

fn chat_error(err: ChatError) -> (StatusCode, String) {
    match err {
        ChatError::Ai(err) => ai_error(err),
        ChatError::NotAnalyzed => (StatusCode::CONFLICT, err.to_string()),
        ChatError::NoPages | ChatError::EmptyQuestion => (StatusCode::BAD_REQUEST, err.to_string()),
    }
}
