use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;
use versemap_core::{
    Book, BookId, CatalogIndex, CatalogSource, ChapterNumber, ChapterRequest, ChapterView,
    ContentSource, NavKey, NavState, PageDirection, Session, Volume,
};
use versemap_geo::{
    extract_location_directives, GeoBounds, LocationDirective, MapMarker, MapSurface,
    MarkerManager,
};
use versemap_view::{
    book_toc_markup, breadcrumb_trail, home_markup, RenderSink, Region, Transition, ViewBuffers,
};

const FLIP_ANIMATION: Duration = Duration::from_millis(350);

#[derive(Debug, Parser)]
#[command(
    name = "versemap",
    version,
    about = "terminal browser for mapped chapter catalogs"
)]
struct Args {
    /// Directory with books.json, volumes.json and chapters/<book>_<chapter>.html
    #[arg(long)]
    library: Option<PathBuf>,

    /// Base URL of the remote catalog endpoints (books, volumes)
    #[arg(long = "catalog-url")]
    catalog_url: Option<Url>,

    /// URL of the remote chapter content endpoint
    #[arg(long = "content-url")]
    content_url: Option<Url>,

    /// Navigation key to open on startup, e.g. "1:5:2"
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Verse range passed through to content fetches
    #[arg(long)]
    verses: Option<String>,

    /// Request the alternate text variant
    #[arg(long = "alternate-text")]
    alternate_text: bool,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

enum Msg {
    ChapterLoaded {
        generation: u64,
        key: NavKey,
        view: ChapterView,
    },
    ChapterFailed {
        generation: u64,
    },
    FlipComplete {
        generation: u64,
        transition: Transition,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "versemap", "versemap")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let (catalog_source, content_source) = build_sources(&args)?;
    let catalog = CatalogIndex::load(catalog_source.as_ref())
        .await
        .context("catalog unavailable; cannot start navigation")?;
    let session = Arc::new(Session::new(Arc::new(catalog), content_source));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut app = App::new(session, tx);

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;

    let start_key = args
        .key
        .as_deref()
        .map(NavKey::new)
        .unwrap_or_else(NavKey::home);
    app.navigate(&start_key, PageDirection::Forward)?;

    run_loop(&mut app, &mut rx).await?;

    let mut stdout = io::stdout();
    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    Ok(())
}

async fn run_loop(app: &mut App, rx: &mut UnboundedReceiver<Msg>) -> Result<()> {
    loop {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && !app.handle_key(key)? {
                    return Ok(());
                }
            }
        }
        while let Ok(msg) = rx.try_recv() {
            app.handle_msg(msg).await?;
        }
        if app.dirty {
            app.redraw()?;
            app.dirty = false;
        }
    }
}

struct App {
    session: Arc<Session>,
    buffers: ViewBuffers,
    sink: TerminalSink,
    markers: MarkerManager<TextMapSurface>,
    directives: Vec<LocationDirective>,
    pending_input: Option<String>,
    notice: Option<String>,
    tx: UnboundedSender<Msg>,
    dirty: bool,
}

impl App {
    fn new(session: Arc<Session>, tx: UnboundedSender<Msg>) -> Self {
        Self {
            session,
            buffers: ViewBuffers::new(),
            sink: TerminalSink::default(),
            markers: MarkerManager::new(TextMapSurface::default()),
            directives: Vec::new(),
            pending_input: None,
            notice: None,
            tx,
            dirty: true,
        }
    }

    fn navigate(&mut self, key: &NavKey, direction: PageDirection) -> Result<()> {
        let ticket = self.session.begin(key);
        self.notice = None;
        match ticket.state {
            NavState::Home | NavState::VolumeToc(_) | NavState::BookToc(_) => {
                let catalog = self.session.catalog();
                let markup = match ticket.state {
                    NavState::VolumeToc(volume_id) => home_markup(catalog, Some(volume_id)),
                    NavState::BookToc(book_id) => {
                        let book = catalog
                            .book(book_id)
                            .ok_or_else(|| anyhow!("resolved book {} disappeared", book_id))?;
                        book_toc_markup(catalog, book)
                    }
                    _ => home_markup(catalog, None),
                };
                let crumbs = breadcrumb_trail(catalog, ticket.state);
                self.buffers.show_static(&mut self.sink, &markup)?;
                self.sink.write_region(Region::Breadcrumb, &crumbs)?;
                self.directives.clear();
                self.markers.recenter();
                // A key that resolved to home may not round-trip; commit
                // the canonical form of what is actually displayed.
                let committed = match ticket.state {
                    NavState::VolumeToc(volume_id) => NavKey::volume(volume_id),
                    NavState::BookToc(book_id) => catalog
                        .book(book_id)
                        .map(|b| NavKey::book(b.parent_volume_id, b.id))
                        .unwrap_or_else(NavKey::home),
                    _ => NavKey::home(),
                };
                self.session.commit(committed, ticket.generation);
                self.dirty = true;
            }
            NavState::Chapter { book_id, chapter } => {
                self.spawn_chapter_fetch(ticket.generation, key.clone(), book_id, chapter, direction);
            }
        }
        Ok(())
    }

    fn spawn_chapter_fetch(
        &self,
        generation: u64,
        key: NavKey,
        book_id: BookId,
        chapter: ChapterNumber,
        direction: PageDirection,
    ) {
        let session = Arc::clone(&self.session);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match session.load_chapter(book_id, chapter, direction).await {
                Ok(view) => {
                    let _ = tx.send(Msg::ChapterLoaded {
                        generation,
                        key,
                        view,
                    });
                }
                Err(err) => {
                    warn!(error = %err, key = %key, "chapter navigation aborted");
                    let _ = tx.send(Msg::ChapterFailed { generation });
                }
            }
        });
    }

    async fn handle_msg(&mut self, msg: Msg) -> Result<()> {
        match msg {
            Msg::ChapterLoaded {
                generation,
                key,
                view,
            } => {
                if !self.session.is_current(generation) {
                    debug!(key = %key, "discarding completion of superseded navigation");
                    return Ok(());
                }
                let state = NavState::Chapter {
                    book_id: view.current.book_id,
                    chapter: view.current.chapter,
                };
                let crumbs = breadcrumb_trail(self.session.catalog(), state);
                self.buffers.show_chapter(&mut self.sink, &view)?;
                self.sink.write_region(Region::Breadcrumb, &crumbs)?;
                // Commit the canonical form of what is displayed, not
                // the raw key that resolved to it.
                self.session.commit(view.current.nav_key(), generation);

                self.directives = extract_location_directives(&view.content);
                let markers: Vec<MapMarker> =
                    self.directives.iter().map(MapMarker::from).collect();
                self.markers.sync(markers).await;
                self.dirty = true;
            }
            Msg::ChapterFailed { generation } => {
                if self.session.is_current(generation) {
                    // Prior view stays; surface the failure on the status line.
                    self.notice = Some("chapter fetch failed".to_string());
                    self.dirty = true;
                }
            }
            Msg::FlipComplete {
                generation,
                transition,
            } => {
                if !self.session.is_current(generation) {
                    debug!("discarding flip superseded by a newer navigation");
                    return Ok(());
                }
                let direction = transition.direction;
                let key = self.buffers.complete_page(transition);
                self.navigate(&key, direction)?;
                self.dirty = true;
            }
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Ok(false);
        }

        if let Some(buffer) = &mut self.pending_input {
            match key.code {
                KeyCode::Char(c) if c.is_ascii_digit() || c == ':' => buffer.push(c),
                KeyCode::Backspace => {
                    buffer.pop();
                }
                KeyCode::Enter => {
                    let target = NavKey::new(buffer.clone());
                    self.pending_input = None;
                    self.navigate(&target, PageDirection::Forward)?;
                }
                KeyCode::Esc => self.pending_input = None,
                _ => {}
            }
            self.dirty = true;
            return Ok(true);
        }

        match key.code {
            KeyCode::Char('q') => return Ok(false),
            KeyCode::Char(':') => {
                self.pending_input = Some(String::new());
                self.dirty = true;
            }
            KeyCode::Char('h') => self.navigate(&NavKey::home(), PageDirection::Forward)?,
            KeyCode::Right | KeyCode::Char('n') => self.start_flip(PageDirection::Forward),
            KeyCode::Left | KeyCode::Char('p') => self.start_flip(PageDirection::Backward),
            KeyCode::Char(c @ '1'..='9') => {
                let index = c as usize - '1' as usize;
                if let Some(directive) = self.directives.get(index) {
                    self.markers.focus(directive);
                    self.dirty = true;
                }
            }
            _ => {}
        }
        Ok(true)
    }

    fn start_flip(&mut self, direction: PageDirection) {
        let Some(transition) = self.buffers.start_page(direction) else {
            return;
        };
        // A navigation typed during the animation supersedes the flip;
        // the snapshot lets the completion detect that.
        let generation = self.session.generation();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(FLIP_ANIMATION).await;
            let _ = tx.send(Msg::FlipComplete {
                generation,
                transition,
            });
        });
    }

    fn redraw(&mut self) -> Result<()> {
        let (cols, rows) = terminal::size()?;
        let cols = cols.max(20) as usize;
        let rows = rows.max(6);

        let mut stdout = io::stdout();
        crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;

        let crumbs = strip_markup(self.sink.region(Region::Breadcrumb)).replace('\n', " > ");
        crossterm::execute!(
            stdout,
            Print(truncate(crumbs.trim_matches([' ', '>']).trim(), cols))
        )?;

        let visible = self.sink.region(self.buffers.active().region());
        let body = strip_markup(visible);
        let body_rows = rows.saturating_sub(4) as usize;
        for (index, line) in body.lines().filter(|l| !l.trim().is_empty()).take(body_rows).enumerate() {
            crossterm::execute!(
                stdout,
                cursor::MoveTo(0, 2 + index as u16),
                Print(truncate(line.trim(), cols))
            )?;
        }

        crossterm::execute!(
            stdout,
            cursor::MoveTo(0, rows - 2),
            Print(truncate(&self.markers.surface().status_line(), cols))
        )?;

        let status = match (&self.pending_input, &self.notice) {
            (Some(pending), _) => format!(":{}", pending),
            (None, Some(notice)) => {
                format!("#{} ({})", self.session.committed_key(), notice)
            }
            (None, None) => format!("#{}", self.session.committed_key()),
        };
        crossterm::execute!(
            stdout,
            cursor::MoveTo(0, rows - 1),
            Print(truncate(&status, cols))
        )?;
        stdout.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct TerminalSink {
    regions: HashMap<Region, String>,
}

impl TerminalSink {
    fn region(&self, region: Region) -> &str {
        self.regions.get(&region).map(String::as_str).unwrap_or("")
    }
}

impl RenderSink for TerminalSink {
    fn write_region(&mut self, region: Region, markup: &str) -> Result<()> {
        self.regions.insert(region, markup.to_string());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
enum Viewport {
    #[default]
    Unset,
    Center {
        latitude: f64,
        longitude: f64,
        zoom: u8,
    },
    Bounds(GeoBounds),
}

/// Stand-in for a real map widget: records marker and viewport state
/// and renders it as a one-line summary.
#[derive(Default)]
struct TextMapSurface {
    markers: Vec<MapMarker>,
    zoom: u8,
    viewport: Viewport,
}

impl TextMapSurface {
    fn status_line(&self) -> String {
        match &self.viewport {
            Viewport::Unset => "map: idle".to_string(),
            Viewport::Center {
                latitude,
                longitude,
                zoom,
            } => {
                let label = self
                    .markers
                    .first()
                    .map(|m| m.placename.as_str())
                    .unwrap_or("default view");
                format!(
                    "map: {} marker(s), {} @ {:.4},{:.4} z{}",
                    self.markers.len(),
                    label,
                    latitude,
                    longitude,
                    zoom
                )
            }
            Viewport::Bounds(bounds) => format!(
                "map: {} markers, fit {:.2}..{:.2} / {:.2}..{:.2}",
                self.markers.len(),
                bounds.south,
                bounds.north,
                bounds.west,
                bounds.east
            ),
        }
    }
}

impl MapSurface for TextMapSurface {
    fn is_ready(&self) -> bool {
        true
    }

    fn add_marker(&mut self, marker: &MapMarker) {
        self.markers.push(marker.clone());
    }

    fn clear_markers(&mut self) {
        self.markers.clear();
    }

    fn set_zoom(&mut self, zoom: u8) {
        self.zoom = zoom;
    }

    fn pan_to(&mut self, latitude: f64, longitude: f64) {
        self.viewport = Viewport::Center {
            latitude,
            longitude,
            zoom: self.zoom,
        };
    }

    fn fit_bounds(&mut self, bounds: &GeoBounds) {
        self.viewport = Viewport::Bounds(*bounds);
    }
}

struct FileCatalogSource {
    root: PathBuf,
}

#[async_trait::async_trait]
impl CatalogSource for FileCatalogSource {
    async fn books_by_id(&self) -> Result<HashMap<BookId, Book>> {
        let path = self.root.join("books.json");
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {:?}", path))?;
        parse_book_map(&bytes)
    }

    async fn volumes(&self) -> Result<Vec<Volume>> {
        let path = self.root.join("volumes.json");
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {:?}", path))?;
        serde_json::from_slice(&bytes).with_context(|| format!("failed to decode {:?}", path))
    }
}

/// Chapter markup from `chapters/<book>_<chapter>.html`. Verse ranges
/// and the alternate variant are remote-only options and are ignored
/// for local libraries.
struct FileContentSource {
    root: PathBuf,
}

#[async_trait::async_trait]
impl ContentSource for FileContentSource {
    async fn fetch(&self, request: &ChapterRequest) -> Result<String> {
        let path = self
            .root
            .join("chapters")
            .join(format!("{}_{}.html", request.book_id, request.chapter));
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {:?}", path))
    }
}

struct HttpCatalogSource {
    agent: ureq::Agent,
    books_url: Url,
    volumes_url: Url,
}

#[async_trait::async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn books_by_id(&self) -> Result<HashMap<BookId, Book>> {
        let body = fetch_blocking(self.agent.clone(), self.books_url.clone()).await?;
        parse_book_map(body.as_bytes())
    }

    async fn volumes(&self) -> Result<Vec<Volume>> {
        let body = fetch_blocking(self.agent.clone(), self.volumes_url.clone()).await?;
        serde_json::from_str(&body).context("failed to decode volumes payload")
    }
}

struct HttpContentSource {
    agent: ureq::Agent,
    base: Url,
    verses: Option<String>,
    alternate_text: bool,
}

#[async_trait::async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch(&self, request: &ChapterRequest) -> Result<String> {
        let request = request
            .clone()
            .with_options(self.verses.clone(), self.alternate_text);
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("book", &request.book_id.to_string())
            .append_pair("chap", &request.chapter.to_string())
            .append_pair("verses", &request.verses_param());
        fetch_blocking(self.agent.clone(), url).await
    }
}

async fn fetch_blocking(agent: ureq::Agent, url: Url) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let response = agent
            .get(url.as_str())
            .call()
            .with_context(|| format!("request to {} failed", url))?;
        response
            .into_string()
            .with_context(|| format!("response from {} was not readable", url))
    })
    .await?
}

fn parse_book_map(bytes: &[u8]) -> Result<HashMap<BookId, Book>> {
    // The wire format keys books by stringified id.
    let raw: HashMap<String, Book> =
        serde_json::from_slice(bytes).context("failed to decode book payload")?;
    raw.into_iter()
        .map(|(key, book)| {
            let id: BookId = key
                .parse()
                .with_context(|| format!("book map key {:?} is not an id", key))?;
            Ok((id, book))
        })
        .collect()
}

fn build_sources(args: &Args) -> Result<(Arc<dyn CatalogSource>, Arc<dyn ContentSource>)> {
    if let Some(library) = &args.library {
        let catalog = FileCatalogSource {
            root: library.clone(),
        };
        let content = FileContentSource {
            root: library.clone(),
        };
        return Ok((Arc::new(catalog), Arc::new(content)));
    }

    let (Some(catalog_url), Some(content_url)) = (&args.catalog_url, &args.content_url) else {
        bail!("pass either --library or both --catalog-url and --content-url");
    };
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(20))
        .build();
    let catalog = HttpCatalogSource {
        agent: agent.clone(),
        books_url: catalog_url.join("books")?,
        volumes_url: catalog_url.join("volumes")?,
    };
    let content = HttpContentSource {
        agent,
        base: content_url.clone(),
        verses: args.verses.clone(),
        alternate_text: args.alternate_text,
    };
    Ok((Arc::new(catalog), Arc::new(content)))
}

fn strip_markup(markup: &str) -> String {
    let mut text = String::new();
    let mut rest = markup;
    while let Some(open) = rest.find('<') {
        text.push_str(&rest[..open]);
        let Some(offset) = rest[open..].find('>') else {
            rest = "";
            break;
        };
        let tag = &rest[open + 1..open + offset];
        let name = tag
            .trim_start_matches('/')
            .split([' ', '\t'])
            .next()
            .unwrap_or("");
        let closes_block = tag.starts_with('/')
            && matches!(name, "p" | "div" | "li" | "ul" | "h1" | "h3" | "a");
        if closes_block || name == "br" {
            if name == "a" {
                text.push(' ');
            } else {
                text.push('\n');
            }
        }
        rest = &rest[open + offset + 1..];
    }
    text.push_str(rest);
    text
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(width.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "versemap.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Console output would tear the raw-mode screen; log to file only.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
