use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Confirm, Input, MultiSelect, Select};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use studyhub::chat::{ChatConfig, ChatSession};
use studyhub::database::Database;
use studyhub::flashcards::{self, DEFAULT_CARDS, Difficulty, StudySession};
use studyhub::pages::{
    DEFAULT_PAGES_PER_VIEW, ImageDirRenderer, PageSet, PdfRenderer, import_document, is_pdf,
};
#[cfg(feature = "server")]
use studyhub::serve::{ServeArgs, run_serve};
use studyhub::storage::{self, DEFAULT_MINDMAP};
use studyhub::{
    AiConfig, BranchDirection, GeminiClient, MindMap, MindMapEditor, TOOLS, export, mindmap_ai,
};

#[derive(Debug, Parser)]
#[command(
    name = "studyhub",
    about = "Flashcards, mind maps and PDF chat from the command line.",
    after_help = "Commands: serve, flashcards, mindmap, pages, chat, export. Run `studyhub <command> --help` for details."
)]
struct LandingArgs {}

#[derive(Debug, Clone, Args)]
struct AiArgs {
    /// API key for the completion endpoint (defaults to GEMINI_API_KEY).
    #[arg(long = "api-key")]
    api_key: Option<String>,

    /// Model name (defaults to STUDYHUB_MODEL or gemini-2.0-flash-exp).
    #[arg(long)]
    model: Option<String>,

    /// Base URL of the completion endpoint.
    #[arg(long = "api-url")]
    api_url: Option<String>,
}

impl AiArgs {
    fn client(&self) -> Result<GeminiClient> {
        let config = AiConfig::from_env().with_overrides(
            self.api_key.clone(),
            self.model.clone(),
            self.api_url.clone(),
        );
        GeminiClient::new(&config).context("Failed to set up the AI client")
    }
}

#[derive(Debug, Clone, Args)]
struct TextArgs {
    /// Text to work from.
    #[arg(short = 't', long, conflicts_with = "file")]
    text: Option<String>,

    /// Read the text from a file. Use '-' to read from stdin.
    #[arg(short = 'f', long)]
    file: Option<String>,
}

impl TextArgs {
    fn load(&self) -> Result<String> {
        match (&self.text, self.file.as_deref()) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some("-")) => {
                let mut buffer = String::new();
                io::stdin()
                    .read_to_string(&mut buffer)
                    .context("failed to read text from stdin")?;
                Ok(buffer)
            }
            (None, Some(path)) => {
                fs::read_to_string(path).with_context(|| format!("failed to read '{path}'"))
            }
            (None, None) => bail!("provide the source text with --text or --file"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "studyhub flashcards", about = "Create, edit, generate and study flashcards.")]
struct FlashcardsArgs {
    #[command(subcommand)]
    command: FlashcardsCommand,
}

#[derive(Debug, Subcommand)]
enum FlashcardsCommand {
    /// Add a card to the deck.
    Add {
        #[arg(long)]
        front: String,
        #[arg(long)]
        back: String,
    },
    /// List every card.
    List,
    /// Replace the text of card NUMBER.
    Edit {
        number: usize,
        #[arg(long)]
        front: String,
        #[arg(long)]
        back: String,
    },
    /// Delete card NUMBER.
    Delete {
        number: usize,
        /// Skip the confirmation prompt.
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Generate cards from text and append them to the deck.
    Generate {
        #[command(flatten)]
        input: TextArgs,
        #[arg(
            short = 'n',
            long,
            default_value_t = DEFAULT_CARDS,
            value_parser = clap::value_parser!(u32).range(1..=10)
        )]
        count: u32,
        #[arg(short = 'd', long, value_enum, default_value_t = Difficulty::Mixed)]
        difficulty: Difficulty,
        #[command(flatten)]
        ai: AiArgs,
    },
    /// Walk through the deck interactively.
    Study {
        /// Shuffle before starting.
        #[arg(long)]
        shuffle: bool,
    },
}

#[derive(Debug, Parser)]
#[command(name = "studyhub mindmap", about = "Generate, edit and export mind maps.")]
struct MindmapArgs {
    #[command(subcommand)]
    command: MindmapCommand,
}

#[derive(Debug, Subcommand)]
enum MindmapCommand {
    /// Generate a mind map from text.
    Generate {
        #[command(flatten)]
        input: TextArgs,
        /// Produce a Mermaid `mindmap` definition instead of an editable map.
        #[arg(long)]
        mermaid: bool,
        /// Name to save the editable map under.
        #[arg(long, default_value = DEFAULT_MINDMAP)]
        name: String,
        /// Write the result to this file instead of stdout.
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        ai: AiArgs,
    },
    /// Print a saved mind map as a Mermaid flowchart.
    Mermaid {
        #[arg(long, default_value = DEFAULT_MINDMAP)]
        name: String,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// Add a branch under PARENT and print its id.
    Branch {
        parent: String,
        #[arg(long, default_value = "right")]
        direction: BranchDirection,
        #[arg(long, default_value = DEFAULT_MINDMAP)]
        name: String,
    },
    /// Delete NODE and everything below it.
    Remove {
        node: String,
        #[arg(long, default_value = DEFAULT_MINDMAP)]
        name: String,
    },
    /// Color NODE and everything below it.
    Color {
        node: String,
        color: String,
        #[arg(long, default_value = DEFAULT_MINDMAP)]
        name: String,
    },
}

#[derive(Debug, Parser)]
#[command(name = "studyhub pages", about = "Manage the pages of the current document.")]
struct PagesArgs {
    #[command(subcommand)]
    command: PagesCommand,
}

#[derive(Debug, Subcommand)]
enum PagesCommand {
    /// Import a PDF file, or pre-rendered page images (png/jpg) from a directory.
    Import {
        path: PathBuf,
        /// Original document to store alongside directory pages.
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// List the stored pages.
    List {
        #[arg(long, default_value_t = 1)]
        view: usize,
        #[arg(long = "per-page", default_value_t = DEFAULT_PAGES_PER_VIEW)]
        per_page: usize,
    },
    /// Pick pages interactively, then delete them or keep only them.
    Select,
    /// Delete the given page numbers.
    Delete {
        #[arg(required = true)]
        pages: Vec<usize>,
    },
    /// Keep only the given page numbers.
    Split {
        #[arg(required = true)]
        pages: Vec<usize>,
    },
    /// Forget the stored document.
    Clear {
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[derive(Debug, Parser)]
#[command(name = "studyhub chat", about = "Ask questions about the stored document.")]
struct ChatArgs {
    /// Question to ask; repeat for several. Without any, an interactive prompt opens.
    #[arg(short = 'q', long = "question")]
    questions: Vec<String>,

    /// Allow answers to draw on web knowledge, cited as [web].
    #[arg(long = "web-search")]
    web_search: bool,

    #[command(flatten)]
    ai: AiArgs,
}

#[derive(Debug, Parser)]
#[command(name = "studyhub export", about = "Write everything stored into a zip bundle.")]
struct ExportArgs {
    #[arg(short = 'o', long, default_value = "studyhub-export.zip")]
    output: PathBuf,
}

pub async fn dispatch() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let rest = || std::iter::once(args[0].clone()).chain(args.iter().skip(2).cloned());
    match args.get(1).map(|s| s.as_str()) {
        Some("serve") => {
            #[cfg(feature = "server")]
            {
                run_serve(ServeArgs::parse_from(rest())).await
            }
            #[cfg(not(feature = "server"))]
            {
                return Err(anyhow!(
                    "'serve' command requires the 'server' feature to be enabled"
                ));
            }
        }
        Some("flashcards") => run_flashcards(FlashcardsArgs::parse_from(rest())).await,
        Some("mindmap") => run_mindmap(MindmapArgs::parse_from(rest())).await,
        Some("pages") => run_pages(PagesArgs::parse_from(rest())).await,
        Some("chat") => run_chat(ChatArgs::parse_from(rest())).await,
        Some("export") => run_export(ExportArgs::parse_from(rest())).await,
        _ => {
            LandingArgs::parse_from(args.iter().cloned());
            print_landing();
            Ok(())
        }
    }
}

fn print_landing() {
    println!("studyhub tools:");
    for (id, name) in TOOLS {
        println!("  {id:<16}{name}");
    }
    println!();
    println!("Run `studyhub --help` for the command list.");
}

async fn run_flashcards(args: FlashcardsArgs) -> Result<()> {
    let db = Database::open_default().await?;
    let pool = db.pool();

    match args.command {
        FlashcardsCommand::Add { front, back } => {
            let mut deck = storage::load_deck(pool).await?;
            let index = deck.add(&front, &back)?;
            storage::save_deck(pool, &deck).await?;
            println!("Added card {}.", index + 1);
        }
        FlashcardsCommand::List => {
            let cards = storage::list_flashcards(pool).await?;
            if cards.is_empty() {
                println!("No flashcards yet.");
            }
            for (idx, card) in cards.iter().enumerate() {
                println!("{}. {}\n   -> {}", idx + 1, card.front, card.back);
            }
        }
        FlashcardsCommand::Edit {
            number,
            front,
            back,
        } => {
            let mut deck = storage::load_deck(pool).await?;
            deck.edit(card_index(number)?, &front, &back)?;
            storage::save_deck(pool, &deck).await?;
            println!("Updated card {number}.");
        }
        FlashcardsCommand::Delete { number, yes } => {
            let mut deck = storage::load_deck(pool).await?;
            let index = card_index(number)?;
            let card = deck
                .cards()
                .get(index)
                .ok_or_else(|| anyhow!("no card at index {number}"))?;
            if !yes && !confirm(&format!("Delete card {number} ({})?", card.front))? {
                println!("Nothing deleted.");
                return Ok(());
            }
            deck.delete(index)?;
            storage::save_deck(pool, &deck).await?;
            println!("Deleted card {number}.");
        }
        FlashcardsCommand::Generate {
            input,
            count,
            difficulty,
            ai,
        } => {
            let text = input.load()?;
            let client = ai.client()?;
            let cards = flashcards::generate_flashcards(&client, &text, count, difficulty).await?;
            let mut deck = storage::load_deck(pool).await?;
            let first = deck.len() + 1;
            deck.extend(cards.iter().cloned());
            storage::save_deck(pool, &deck).await?;
            for (offset, card) in cards.iter().enumerate() {
                println!("{}. {}\n   -> {}", first + offset, card.front, card.back);
            }
            println!("Generated {} card(s).", cards.len());
        }
        FlashcardsCommand::Study { shuffle } => run_study(&db, shuffle).await?,
    }
    Ok(())
}

fn card_index(number: usize) -> Result<usize> {
    number
        .checked_sub(1)
        .ok_or_else(|| anyhow!("card numbers start at 1"))
}

async fn run_study(db: &Database, shuffle: bool) -> Result<()> {
    let pool = db.pool();
    let mut deck = storage::load_deck(pool).await?;
    if deck.is_empty() {
        println!("No flashcards yet. Add some with `studyhub flashcards add`.");
        return Ok(());
    }

    let mut session = StudySession::new(deck.cards());
    if shuffle {
        session.shuffle(&mut rand::thread_rng());
    }

    let actions = ["Flip", "Next", "Previous", "Shuffle", "Delete card", "Quit"];
    loop {
        let Some(side) = session.visible_side() else {
            println!("No cards left.");
            break;
        };
        let label = if session.is_flipped() { "Back" } else { "Front" };
        println!("\n[{}/{}] {label}: {side}", session.position() + 1, session.len());

        let choice = Select::new()
            .with_prompt("Action")
            .items(&actions)
            .default(0)
            .interact()
            .context("study session was cancelled")?;

        match choice {
            0 => session.flip(),
            1 => session.next(),
            2 => session.previous(),
            3 => session.shuffle(&mut rand::thread_rng()),
            4 => {
                let Some(card) = session.remove_current() else {
                    continue;
                };
                if let Some(index) = deck.cards().iter().position(|c| *c == card) {
                    deck.delete(index)?;
                    storage::save_deck(pool, &deck).await?;
                }
            }
            _ => break,
        }
    }
    Ok(())
}

async fn run_mindmap(args: MindmapArgs) -> Result<()> {
    let db = Database::open_default().await?;
    let pool = db.pool();

    match args.command {
        MindmapCommand::Generate {
            input,
            mermaid,
            name,
            output,
            ai,
        } => {
            let text = input.load()?;
            let client = ai.client()?;
            let definition = if mermaid {
                mindmap_ai::generate_mermaid(&client, &text).await?
            } else {
                let map = mindmap_ai::generate_graph(&client, &text)
                    .await?
                    .into_mind_map();
                storage::save_mindmap(pool, &name, &map).await?;
                eprintln!("Saved mind map '{name}' ({} nodes).", map.nodes.len());
                map.to_mermaid()
            };
            write_text(output, &definition)?;
        }
        MindmapCommand::Mermaid { name, output } => {
            let map = load_map(&db, &name).await?;
            write_text(output, &map.to_mermaid())?;
        }
        MindmapCommand::Branch {
            parent,
            direction,
            name,
        } => {
            let mut editor = MindMapEditor::new(load_map(&db, &name).await?);
            let id = editor
                .add_branch(&parent, direction)
                .ok_or_else(|| anyhow!("node '{parent}' not found"))?;
            storage::save_mindmap(pool, &name, editor.map()).await?;
            println!("{id}");
        }
        MindmapCommand::Remove { node, name } => {
            let mut editor = MindMapEditor::new(load_map(&db, &name).await?);
            let removed = editor.delete_node(&node);
            if removed.is_empty() {
                bail!("node '{node}' not found");
            }
            storage::save_mindmap(pool, &name, editor.map()).await?;
            println!("Removed {} node(s).", removed.len());
        }
        MindmapCommand::Color { node, color, name } => {
            let mut editor = MindMapEditor::new(load_map(&db, &name).await?);
            let touched = editor.change_color(&node, &color)?;
            storage::save_mindmap(pool, &name, editor.map()).await?;
            println!("Colored {touched} node(s).");
        }
    }
    Ok(())
}

/// The saved map `name`; the default name falls back to a fresh map.
async fn load_map(db: &Database, name: &str) -> Result<MindMap> {
    match storage::load_mindmap(db.pool(), name).await? {
        Some(map) => Ok(map),
        None if name == DEFAULT_MINDMAP => Ok(MindMap::default()),
        None => bail!("no mind map named '{name}'"),
    }
}

fn write_text(output: Option<PathBuf>, text: &str) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(&path, text).with_context(|| format!("failed to write '{}'", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(text.as_bytes())
                .context("failed to write to stdout")?;
            if !text.ends_with('\n') {
                writeln!(stdout).context("failed to write to stdout")?;
            }
        }
    }
    Ok(())
}

async fn run_pages(args: PagesArgs) -> Result<()> {
    let db = Database::open_default().await?;
    let pool = db.pool();

    match args.command {
        PagesCommand::Import { path, source } => {
            let mut report = |percent: u8| eprint!("\rImporting... {percent:>3}%");
            let document = if is_pdf(&path) {
                let renderer = PdfRenderer::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                import_document(Some(&path), &renderer, &mut report)?
            } else {
                let renderer = ImageDirRenderer::open(&path)?;
                import_document(source.as_deref(), &renderer, &mut report)?
            };
            eprintln!();
            storage::store_pages(pool, &document.pages).await?;
            if let Some(file) = &document.file {
                storage::store_file(pool, file).await?;
            }
            println!("Imported {} page(s).", document.pages.len());
        }
        PagesCommand::List { view, per_page } => {
            let set = PageSet::new(storage::retrieve_pages(pool).await?);
            if set.is_empty() {
                println!("No pages stored.");
                return Ok(());
            }
            let first = (view.max(1) - 1) * per_page + 1;
            for (offset, page) in set.page(view, per_page).iter().enumerate() {
                println!(
                    "Page {}: {} ({} bytes)",
                    first + offset,
                    page.mime_type(),
                    page.decode()?.len()
                );
            }
            println!("View {view} of {}; {} page(s) in total.", set.view_count(per_page), set.len());
        }
        PagesCommand::Select => {
            let mut set = PageSet::new(storage::retrieve_pages(pool).await?);
            if set.is_empty() {
                println!("No pages stored.");
                return Ok(());
            }
            let items: Vec<String> = (1..=set.len()).map(|n| format!("Page {n}")).collect();
            let picked = MultiSelect::new()
                .with_prompt("Select pages")
                .items(&items)
                .interact()
                .context("page selection was cancelled")?;
            for index in picked {
                set.toggle_selection(index + 1)?;
            }
            let action = Select::new()
                .with_prompt("Action")
                .items(&["Delete selected pages", "Keep only selected pages"])
                .default(0)
                .interact()
                .context("page action was cancelled")?;
            if action == 0 {
                set.delete_selected()?;
            } else {
                set.split()?;
            }
            storage::store_pages(pool, set.pages()).await?;
            println!("{} page(s) remain.", set.len());
        }
        PagesCommand::Delete { pages } => {
            let mut set = select_pages(&db, &pages).await?;
            let removed = set.delete_selected()?;
            storage::store_pages(pool, set.pages()).await?;
            println!("Deleted {removed} page(s); {} remain.", set.len());
        }
        PagesCommand::Split { pages } => {
            let mut set = select_pages(&db, &pages).await?;
            let kept = set.split()?;
            storage::store_pages(pool, set.pages()).await?;
            println!("Kept {kept} page(s).");
        }
        PagesCommand::Clear { yes } => {
            if !yes && !confirm("Forget the stored document and all its pages?")? {
                println!("Nothing cleared.");
                return Ok(());
            }
            storage::clear_document(pool).await?;
            println!("Cleared the stored document.");
        }
    }
    Ok(())
}

async fn select_pages(db: &Database, numbers: &[usize]) -> Result<PageSet> {
    let mut set = PageSet::new(storage::retrieve_pages(db.pool()).await?);
    let mut numbers = numbers.to_vec();
    numbers.sort_unstable();
    numbers.dedup();
    for number in numbers {
        set.toggle_selection(number)?;
    }
    Ok(set)
}

async fn run_chat(args: ChatArgs) -> Result<()> {
    let db = Database::open_default().await?;
    let pages = storage::retrieve_pages(db.pool()).await?;
    if pages.is_empty() {
        bail!("no PDF pages stored; import some with `studyhub pages import`");
    }
    let client = args.ai.client()?;

    let mut session = ChatSession::new(ChatConfig::default());
    session.set_web_search(args.web_search);
    eprintln!("Analyzing {} page(s)...", pages.len());
    let analysis = session
        .analyze(&client, &pages, |done, total| {
            eprintln!("Pages 1-{done} of {total} analyzed.");
        })
        .await?;
    eprintln!("Topic: {}", analysis.topic);

    if !args.questions.is_empty() {
        for question in &args.questions {
            let answer = session.ask(&client, question).await?;
            println!("Q: {question}\nA: {}\n", answer.text);
        }
        return Ok(());
    }

    loop {
        let question: String = Input::new()
            .with_prompt("Question (empty to quit)")
            .allow_empty(true)
            .interact_text()
            .context("failed to read question")?;
        if question.trim().is_empty() {
            break;
        }
        let answer = session.ask(&client, &question).await?;
        println!("{}\n", answer.text);
    }
    Ok(())
}

async fn run_export(args: ExportArgs) -> Result<()> {
    let db = Database::open_default().await?;
    let bundle = export::export_bundle(db.pool()).await?;
    if bundle.is_empty() {
        println!("Nothing to export.");
        return Ok(());
    }
    fs::write(&args.output, &bundle)
        .with_context(|| format!("failed to write '{}'", args.output.display()))?;
    println!("Exported to {}", args.output.display());
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("confirmation was cancelled")
}
