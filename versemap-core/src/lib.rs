use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub type VolumeId = u32;
pub type BookId = u32;
pub type ChapterNumber = u32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    #[serde(rename = "fullName")]
    pub full_name: String,
    #[serde(rename = "tocName")]
    pub toc_name: String,
    #[serde(rename = "minBookId")]
    pub min_book_id: BookId,
    #[serde(rename = "maxBookId")]
    pub max_book_id: BookId,
    /// Derived from the book map once both catalog payloads have
    /// arrived; never part of the wire format.
    #[serde(skip)]
    pub books: Vec<Book>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    #[serde(rename = "parentBookId")]
    pub parent_volume_id: VolumeId,
    #[serde(rename = "fullName")]
    pub full_name: String,
    #[serde(rename = "tocName")]
    pub toc_name: String,
    #[serde(rename = "gridName")]
    pub grid_name: String,
    #[serde(rename = "numChapters")]
    pub num_chapters: u32,
}

impl Book {
    /// A book without chapter subdivision renders as a single page
    /// addressed as chapter 0.
    pub fn is_single_page(&self) -> bool {
        self.num_chapters == 0
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog unavailable")]
    Unavailable(#[source] anyhow::Error),
    #[error("volume {volume_id} references missing book {book_id}")]
    MissingBook { volume_id: VolumeId, book_id: BookId },
    #[error("volume {volume_id} has inverted book range {min_book_id}..={max_book_id}")]
    InvertedRange {
        volume_id: VolumeId,
        min_book_id: BookId,
        max_book_id: BookId,
    },
}

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content fetch failed for book {book_id} chapter {chapter}")]
    FetchFailed {
        book_id: BookId,
        chapter: ChapterNumber,
        #[source]
        source: anyhow::Error,
    },
    #[error("book {book_id} is not in the catalog")]
    UnknownBook { book_id: BookId },
}

/// Serialized navigation address: 0-3 colon-separated integers,
/// `volumeId[:bookId[:chapter]]`. The empty key addresses home.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NavKey(String);

impl NavKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn home() -> Self {
        Self(String::new())
    }

    pub fn volume(volume_id: VolumeId) -> Self {
        Self(volume_id.to_string())
    }

    pub fn book(volume_id: VolumeId, book_id: BookId) -> Self {
        Self(format!("{}:{}", volume_id, book_id))
    }

    pub fn chapter(volume_id: VolumeId, book_id: BookId, chapter: ChapterNumber) -> Self {
        Self(format!("{}:{}:{}", volume_id, book_id, chapter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_home(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for NavKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    Home,
    VolumeToc(VolumeId),
    BookToc(BookId),
    Chapter {
        book_id: BookId,
        chapter: ChapterNumber,
    },
}

/// Identifies a chapter without its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    pub volume_id: VolumeId,
    pub book_id: BookId,
    pub chapter: ChapterNumber,
    pub title: String,
}

impl ChapterRef {
    pub fn nav_key(&self) -> NavKey {
        NavKey::chapter(self.volume_id, self.book_id, self.chapter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDirection {
    Forward,
    Backward,
}

/// Parameters for a single content fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChapterRequest {
    pub book_id: BookId,
    pub chapter: ChapterNumber,
    pub verses: Option<String>,
    pub alternate_text: bool,
}

impl ChapterRequest {
    pub fn new(book_id: BookId, chapter: ChapterNumber) -> Self {
        Self {
            book_id,
            chapter,
            ..Self::default()
        }
    }

    pub fn with_options(mut self, verses: Option<String>, alternate_text: bool) -> Self {
        self.verses = verses;
        self.alternate_text = alternate_text;
        self
    }

    /// Value of the `verses` query parameter expected by the remote
    /// content endpoint: the verse range, with the alternate-variant
    /// switch packed onto the end.
    pub fn verses_param(&self) -> String {
        let mut options = String::new();
        if let Some(verses) = &self.verses {
            options.push_str(verses);
        }
        if self.alternate_text {
            options.push_str("&jst=JST");
        }
        options
    }
}

#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    async fn books_by_id(&self) -> Result<HashMap<BookId, Book>>;
    async fn volumes(&self) -> Result<Vec<Volume>>;
}

#[async_trait::async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, request: &ChapterRequest) -> Result<String>;
}

/// In-memory volume/book lookup, built once from the two catalog
/// payloads and read-only afterwards.
#[derive(Debug)]
pub struct CatalogIndex {
    books: HashMap<BookId, Book>,
    volumes: Vec<Volume>,
}

impl CatalogIndex {
    /// Issues both catalog fetches concurrently and builds the derived
    /// per-volume book lists once the later of the two completes.
    /// Either failure leaves the index unbuilt.
    #[instrument(skip(source))]
    pub async fn load(source: &dyn CatalogSource) -> Result<Self, CatalogError> {
        let (books, volumes) = tokio::join!(source.books_by_id(), source.volumes());
        let books = books.map_err(CatalogError::Unavailable)?;
        let volumes = volumes.map_err(CatalogError::Unavailable)?;
        Self::from_parts(books, volumes)
    }

    /// Assembles the index from already-fetched payloads, validating
    /// that every volume's book range resolves.
    pub fn from_parts(
        books: HashMap<BookId, Book>,
        mut volumes: Vec<Volume>,
    ) -> Result<Self, CatalogError> {
        for volume in &mut volumes {
            if volume.min_book_id > volume.max_book_id {
                return Err(CatalogError::InvertedRange {
                    volume_id: volume.id,
                    min_book_id: volume.min_book_id,
                    max_book_id: volume.max_book_id,
                });
            }
            let mut volume_books = Vec::new();
            for book_id in volume.min_book_id..=volume.max_book_id {
                let book = books.get(&book_id).ok_or(CatalogError::MissingBook {
                    volume_id: volume.id,
                    book_id,
                })?;
                volume_books.push(book.clone());
            }
            volume.books = volume_books;
        }
        debug!(
            volumes = volumes.len(),
            books = books.len(),
            "catalog index built"
        );
        Ok(Self { books, volumes })
    }

    pub fn book(&self, book_id: BookId) -> Option<&Book> {
        self.books.get(&book_id)
    }

    pub fn volume(&self, volume_id: VolumeId) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.id == volume_id)
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn volume_of(&self, book: &Book) -> Option<&Volume> {
        self.volume(book.parent_volume_id)
    }

    /// Chapter numbers run 1..=num_chapters; chapter 0 is legal only
    /// for single-page books.
    pub fn book_chapter_valid(&self, book_id: BookId, chapter: ChapterNumber) -> bool {
        match self.book(book_id) {
            Some(book) => chapter <= book.num_chapters && !(chapter == 0 && book.num_chapters > 0),
            None => false,
        }
    }

    /// Total resolution of a navigation key: malformed or out-of-range
    /// input degrades to home, never an error.
    pub fn resolve(&self, key: &NavKey) -> NavState {
        let raw = key.as_str().trim();
        if raw.is_empty() {
            return NavState::Home;
        }

        let parts: Vec<&str> = raw.split(':').collect();
        let Some(ids) = parse_ids(&parts) else {
            debug!(key = raw, "malformed navigation key, resolving to home");
            return NavState::Home;
        };

        match ids.len() {
            1 => {
                let volume_id = ids[0];
                let in_range = match (self.volumes.first(), self.volumes.last()) {
                    (Some(first), Some(last)) => volume_id >= first.id && volume_id <= last.id,
                    _ => false,
                };
                if in_range {
                    NavState::VolumeToc(volume_id)
                } else {
                    debug!(key = raw, "volume out of range, resolving to home");
                    NavState::Home
                }
            }
            2 => {
                let book_id = ids[1];
                if self.book(book_id).is_some() {
                    NavState::BookToc(book_id)
                } else {
                    debug!(key = raw, "unknown book, resolving to home");
                    NavState::Home
                }
            }
            _ => {
                let book_id = ids[1];
                let chapter = ids[2];
                if self.book_chapter_valid(book_id, chapter) {
                    NavState::Chapter { book_id, chapter }
                } else {
                    debug!(key = raw, "invalid chapter, resolving to home");
                    NavState::Home
                }
            }
        }
    }

    fn chapter_ref(&self, book: &Book, chapter: ChapterNumber) -> ChapterRef {
        ChapterRef {
            volume_id: book.parent_volume_id,
            book_id: book.id,
            chapter,
            title: title_for_book_chapter(book, chapter),
        }
    }

    /// Chapter immediately after the given one, crossing into the next
    /// book's first chapter (0 for single-page books) at a boundary.
    pub fn next_chapter(&self, book_id: BookId, chapter: ChapterNumber) -> Option<ChapterRef> {
        let book = self.book(book_id)?;
        if chapter < book.num_chapters {
            return Some(self.chapter_ref(book, chapter + 1));
        }
        let next_book = self.book(book_id + 1)?;
        let target = if next_book.num_chapters > 0 { 1 } else { 0 };
        Some(self.chapter_ref(next_book, target))
    }

    /// Chapter immediately before the given one, crossing into the
    /// previous book's last chapter at a boundary.
    pub fn previous_chapter(&self, book_id: BookId, chapter: ChapterNumber) -> Option<ChapterRef> {
        let book = self.book(book_id)?;
        if chapter > 1 {
            return Some(self.chapter_ref(book, chapter - 1));
        }
        let previous_book = self.book(book_id.checked_sub(1)?)?;
        Some(self.chapter_ref(previous_book, previous_book.num_chapters))
    }
}

pub fn title_for_book_chapter(book: &Book, chapter: ChapterNumber) -> String {
    if chapter > 0 {
        format!("{} {}", book.toc_name, chapter)
    } else {
        book.toc_name.clone()
    }
}

/// Prefetched content for one neighbor of the current chapter.
#[derive(Debug, Clone)]
pub struct NeighborContent {
    pub target: ChapterRef,
    pub direction: PageDirection,
    pub content: String,
}

/// Everything needed to present a chapter: its content, both neighbor
/// identities, and at most one neighbor's prefetched content.
#[derive(Debug, Clone)]
pub struct ChapterView {
    pub current: ChapterRef,
    pub content: String,
    pub previous: Option<ChapterRef>,
    pub next: Option<ChapterRef>,
    pub neighbor: Option<NeighborContent>,
}

/// Handle for one navigation attempt. Completions carrying a stale
/// generation must be discarded by the caller.
#[derive(Debug, Clone, Copy)]
pub struct NavTicket {
    pub generation: u64,
    pub state: NavState,
}

struct SessionState {
    committed: NavKey,
    generation: u64,
}

/// Owns the catalog, the content source, and the navigation
/// generation counter that lets a newer navigation supersede any
/// earlier in-flight one.
pub struct Session {
    catalog: Arc<CatalogIndex>,
    content: Arc<dyn ContentSource>,
    inner: Mutex<SessionState>,
}

impl Session {
    pub fn new(catalog: Arc<CatalogIndex>, content: Arc<dyn ContentSource>) -> Self {
        Self {
            catalog,
            content,
            inner: Mutex::new(SessionState {
                committed: NavKey::home(),
                generation: 0,
            }),
        }
    }

    pub fn catalog(&self) -> &CatalogIndex {
        &self.catalog
    }

    /// Resolves the key and opens a new navigation generation,
    /// invalidating every earlier in-flight fetch.
    pub fn begin(&self, key: &NavKey) -> NavTicket {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let state = self.catalog.resolve(key);
        debug!(key = %key, generation = inner.generation, ?state, "navigation begun");
        NavTicket {
            generation: inner.generation,
            state,
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Records the displayed key, but only for the live generation;
    /// a completion from an abandoned navigation is dropped here.
    pub fn commit(&self, key: NavKey, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            warn!(
                key = %key,
                stale = generation,
                current = inner.generation,
                "discarding stale navigation commit"
            );
            return false;
        }
        inner.committed = key;
        true
    }

    pub fn committed_key(&self) -> NavKey {
        self.inner.lock().committed.clone()
    }

    /// Resolves current plus one neighbor's content as a two-hop fetch
    /// chain. Both neighbor targets are fixed before any fetch is
    /// issued. Failure of the current fetch aborts the transition;
    /// failure of the neighbor fetch only degrades paging.
    #[instrument(skip(self))]
    pub async fn load_chapter(
        &self,
        book_id: BookId,
        chapter: ChapterNumber,
        direction: PageDirection,
    ) -> Result<ChapterView, ContentError> {
        let book = self
            .catalog
            .book(book_id)
            .ok_or(ContentError::UnknownBook { book_id })?;
        let current = self.catalog.chapter_ref(book, chapter);
        let previous = self.catalog.previous_chapter(book_id, chapter);
        let next = self.catalog.next_chapter(book_id, chapter);

        let content = self
            .content
            .fetch(&ChapterRequest::new(book_id, chapter))
            .await
            .map_err(|source| ContentError::FetchFailed {
                book_id,
                chapter,
                source,
            })?;

        // Prefetch the side that pairs with the paging direction; at a
        // catalog boundary the only reachable side is taken instead.
        let target = match direction {
            PageDirection::Forward => next.clone().or_else(|| previous.clone()),
            PageDirection::Backward => previous.clone().or_else(|| next.clone()),
        };
        let neighbor = match target {
            Some(target) => {
                let neighbor_direction = if Some(&target) == next.as_ref() {
                    PageDirection::Forward
                } else {
                    PageDirection::Backward
                };
                match self
                    .content
                    .fetch(&ChapterRequest::new(target.book_id, target.chapter))
                    .await
                {
                    Ok(content) => Some(NeighborContent {
                        target,
                        direction: neighbor_direction,
                        content,
                    }),
                    Err(err) => {
                        warn!(
                            book = target.book_id,
                            chapter = target.chapter,
                            error = %err,
                            "neighbor prefetch failed, paging will re-fetch on demand"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        Ok(ChapterView {
            current,
            content,
            previous,
            next,
            neighbor,
        })
    }
}

fn parse_ids(parts: &[&str]) -> Option<Vec<u32>> {
    parts
        .iter()
        .take(3)
        .map(|part| part.trim().parse::<u32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(id: BookId, volume: VolumeId, toc_name: &str, num_chapters: u32) -> Book {
        Book {
            id,
            parent_volume_id: volume,
            full_name: format!("The Book of {}", toc_name),
            toc_name: toc_name.to_string(),
            grid_name: toc_name.to_string(),
            num_chapters,
        }
    }

    fn volume(id: VolumeId, name: &str, min: BookId, max: BookId) -> Volume {
        Volume {
            id,
            full_name: name.to_string(),
            toc_name: name.to_string(),
            min_book_id: min,
            max_book_id: max,
            books: Vec::new(),
        }
    }

    fn sample_catalog() -> CatalogIndex {
        let books = [
            book(1, 1, "Alpha", 50),
            book(2, 1, "Beta", 0),
            book(3, 1, "Gamma", 4),
            book(4, 2, "Delta", 10),
            book(5, 2, "Epsilon", 2),
            book(6, 2, "Zeta", 3),
        ]
        .into_iter()
        .map(|b| (b.id, b))
        .collect();
        let volumes = vec![volume(1, "First Collection", 1, 3), volume(2, "Second Collection", 4, 6)];
        CatalogIndex::from_parts(books, volumes).unwrap()
    }

    struct FakeCatalog {
        fail_books: bool,
        fail_volumes: bool,
    }

    #[async_trait::async_trait]
    impl CatalogSource for FakeCatalog {
        async fn books_by_id(&self) -> Result<HashMap<BookId, Book>> {
            if self.fail_books {
                anyhow::bail!("books endpoint down");
            }
            Ok([book(1, 1, "Alpha", 2)].into_iter().map(|b| (b.id, b)).collect())
        }

        async fn volumes(&self) -> Result<Vec<Volume>> {
            if self.fail_volumes {
                anyhow::bail!("volumes endpoint down");
            }
            Ok(vec![volume(1, "First Collection", 1, 1)])
        }
    }

    struct FakeContent {
        fail_current_of: Option<(BookId, ChapterNumber)>,
        fetches: Mutex<Vec<(BookId, ChapterNumber)>>,
    }

    impl FakeContent {
        fn new() -> Self {
            Self {
                fail_current_of: None,
                fetches: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(book_id: BookId, chapter: ChapterNumber) -> Self {
            Self {
                fail_current_of: Some((book_id, chapter)),
                fetches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ContentSource for FakeContent {
        async fn fetch(&self, request: &ChapterRequest) -> Result<String> {
            self.fetches
                .lock()
                .push((request.book_id, request.chapter));
            if self.fail_current_of == Some((request.book_id, request.chapter)) {
                anyhow::bail!("server error");
            }
            Ok(format!("content {}:{}", request.book_id, request.chapter))
        }
    }

    fn session_with(content: FakeContent) -> Session {
        Session::new(Arc::new(sample_catalog()), Arc::new(content))
    }

    #[test]
    fn resolve_is_total_over_malformed_keys() {
        let catalog = sample_catalog();
        for raw in ["abc", "1:x", "1:5:two", ":", "-1", "1::2"] {
            let state = catalog.resolve(&NavKey::new(raw));
            assert_eq!(state, NavState::Home, "key {:?}", raw);
        }
        assert_eq!(catalog.resolve(&NavKey::home()), NavState::Home);
        assert_eq!(catalog.resolve(&NavKey::new("   ")), NavState::Home);
        // Parts beyond the third are ignored, not rejected.
        assert_eq!(
            catalog.resolve(&NavKey::new("1:5:2:9")),
            NavState::Chapter {
                book_id: 5,
                chapter: 2
            }
        );
    }

    #[test]
    fn resolve_volume_checks_id_range() {
        let catalog = sample_catalog();
        assert_eq!(
            catalog.resolve(&NavKey::new("2")),
            NavState::VolumeToc(2)
        );
        assert_eq!(catalog.resolve(&NavKey::new("0")), NavState::Home);
        assert_eq!(catalog.resolve(&NavKey::new("3")), NavState::Home);
    }

    #[test]
    fn resolve_book_requires_existing_book() {
        let catalog = sample_catalog();
        assert_eq!(catalog.resolve(&NavKey::new("1:5")), NavState::BookToc(5));
        assert_eq!(catalog.resolve(&NavKey::new("1:99")), NavState::Home);
    }

    #[test]
    fn resolve_chapter_scenario() {
        let catalog = sample_catalog();
        assert_eq!(
            catalog.resolve(&NavKey::new("1:5:2")),
            NavState::Chapter {
                book_id: 5,
                chapter: 2
            }
        );
        // Chapter beyond the book's range falls back to home.
        assert_eq!(catalog.resolve(&NavKey::new("1:5:3")), NavState::Home);
        // Chapter 0 is only legal for single-page books.
        assert_eq!(catalog.resolve(&NavKey::new("1:5:0")), NavState::Home);
        assert_eq!(
            catalog.resolve(&NavKey::new("1:2:0")),
            NavState::Chapter {
                book_id: 2,
                chapter: 0
            }
        );
    }

    #[test]
    fn volume_toc_lists_books_in_catalog_order() {
        let catalog = sample_catalog();
        let volume = catalog.volume(2).unwrap();
        let ids: Vec<BookId> = volume.books.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![4, 5, 6]);
    }

    #[test]
    fn neighbor_scenario_at_book_boundary() {
        let catalog = sample_catalog();
        let next = catalog.next_chapter(5, 2).unwrap();
        assert_eq!((next.book_id, next.chapter), (6, 1));
        assert_eq!(next.title, "Zeta 1");

        let previous = catalog.previous_chapter(5, 2).unwrap();
        assert_eq!((previous.book_id, previous.chapter), (5, 1));
        assert_eq!(previous.title, "Epsilon 1");
    }

    #[test]
    fn neighbor_round_trip_on_interior_chapters() {
        let catalog = sample_catalog();
        for (book_id, chapter) in [(1, 25), (3, 2), (4, 9), (6, 2)] {
            let previous = catalog.previous_chapter(book_id, chapter).unwrap();
            let back = catalog
                .next_chapter(previous.book_id, previous.chapter)
                .unwrap();
            assert_eq!((back.book_id, back.chapter), (book_id, chapter));
        }
    }

    #[test]
    fn single_page_book_traversed_exactly_once() {
        let catalog = sample_catalog();
        // Forward: last chapter of Alpha -> Beta page -> first of Gamma.
        let into = catalog.next_chapter(1, 50).unwrap();
        assert_eq!((into.book_id, into.chapter), (2, 0));
        assert_eq!(into.title, "Beta");
        let out = catalog.next_chapter(2, 0).unwrap();
        assert_eq!((out.book_id, out.chapter), (3, 1));

        // Backward: first of Gamma -> Beta page -> last chapter of Alpha.
        let back_in = catalog.previous_chapter(3, 1).unwrap();
        assert_eq!((back_in.book_id, back_in.chapter), (2, 0));
        let back_out = catalog.previous_chapter(2, 0).unwrap();
        assert_eq!((back_out.book_id, back_out.chapter), (1, 50));
    }

    #[test]
    fn neighbors_absent_at_catalog_edges() {
        let catalog = sample_catalog();
        assert!(catalog.previous_chapter(1, 1).is_none());
        assert!(catalog.next_chapter(6, 3).is_none());
        assert!(catalog.next_chapter(99, 1).is_none());
    }

    #[tokio::test]
    async fn catalog_load_joins_both_fetches() {
        let source = FakeCatalog {
            fail_books: false,
            fail_volumes: false,
        };
        let catalog = CatalogIndex::load(&source).await.unwrap();
        assert_eq!(catalog.volumes().len(), 1);
        assert_eq!(catalog.volume(1).unwrap().books.len(), 1);
    }

    #[tokio::test]
    async fn catalog_load_fails_when_either_fetch_fails() {
        for (fail_books, fail_volumes) in [(true, false), (false, true)] {
            let source = FakeCatalog {
                fail_books,
                fail_volumes,
            };
            let err = CatalogIndex::load(&source).await.unwrap_err();
            assert!(matches!(err, CatalogError::Unavailable(_)));
        }
    }

    #[test]
    fn catalog_build_rejects_missing_book() {
        let books = [book(1, 1, "Alpha", 2)]
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        let err =
            CatalogIndex::from_parts(books, vec![volume(1, "First Collection", 1, 2)]).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::MissingBook {
                volume_id: 1,
                book_id: 2
            }
        ));
    }

    #[tokio::test]
    async fn load_chapter_prefetches_direction_side() {
        let session = session_with(FakeContent::new());
        let view = session
            .load_chapter(5, 1, PageDirection::Forward)
            .await
            .unwrap();
        assert_eq!(view.content, "content 5:1");
        let neighbor = view.neighbor.unwrap();
        assert_eq!((neighbor.target.book_id, neighbor.target.chapter), (5, 2));
        assert_eq!(neighbor.direction, PageDirection::Forward);

        let view = session
            .load_chapter(5, 2, PageDirection::Backward)
            .await
            .unwrap();
        let neighbor = view.neighbor.unwrap();
        assert_eq!((neighbor.target.book_id, neighbor.target.chapter), (5, 1));
        assert_eq!(neighbor.direction, PageDirection::Backward);
    }

    #[tokio::test]
    async fn load_chapter_falls_back_to_reachable_side_at_edge() {
        let session = session_with(FakeContent::new());
        // Backward from the very first chapter: only the next side exists.
        let view = session
            .load_chapter(1, 1, PageDirection::Backward)
            .await
            .unwrap();
        assert!(view.previous.is_none());
        let neighbor = view.neighbor.unwrap();
        assert_eq!((neighbor.target.book_id, neighbor.target.chapter), (1, 2));
        assert_eq!(neighbor.direction, PageDirection::Forward);
    }

    #[tokio::test]
    async fn load_chapter_fetches_current_then_neighbor() {
        let content = Arc::new(FakeContent::new());
        let session = Session::new(Arc::new(sample_catalog()), content.clone());
        session
            .load_chapter(5, 1, PageDirection::Forward)
            .await
            .unwrap();
        assert_eq!(*content.fetches.lock(), vec![(5, 1), (5, 2)]);
    }

    #[tokio::test]
    async fn load_chapter_current_failure_aborts() {
        let session = session_with(FakeContent::failing_on(5, 1));
        let err = session
            .load_chapter(5, 1, PageDirection::Forward)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContentError::FetchFailed {
                book_id: 5,
                chapter: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn load_chapter_neighbor_failure_degrades_only() {
        let session = session_with(FakeContent::failing_on(5, 2));
        let view = session
            .load_chapter(5, 1, PageDirection::Forward)
            .await
            .unwrap();
        assert_eq!(view.content, "content 5:1");
        assert!(view.neighbor.is_none());
        // Both neighbor identities are still known for paging controls.
        assert!(view.previous.is_some());
        assert!(view.next.is_some());
    }

    #[test]
    fn stale_generation_cannot_commit() {
        let session = session_with(FakeContent::new());
        let first = session.begin(&NavKey::new("1:5:1"));
        let second = session.begin(&NavKey::new("1:5:2"));

        assert!(session.commit(NavKey::new("1:5:2"), second.generation));
        // The abandoned navigation resolves late and must be discarded.
        assert!(!session.is_current(first.generation));
        assert!(!session.commit(NavKey::new("1:5:1"), first.generation));
        assert_eq!(session.committed_key(), NavKey::new("1:5:2"));
    }

    #[test]
    fn verses_param_packs_variant_flag() {
        let plain = ChapterRequest::new(5, 1);
        assert_eq!(plain.verses_param(), "");

        let ranged = ChapterRequest::new(5, 1).with_options(Some("3-7".into()), false);
        assert_eq!(ranged.verses_param(), "3-7");

        let variant = ChapterRequest::new(5, 1).with_options(Some("3-7".into()), true);
        assert_eq!(variant.verses_param(), "3-7&jst=JST");
    }

    #[test]
    fn begin_supersedes_prior_generation() {
        let session = session_with(FakeContent::new());
        let mut last = 0;
        for key in ["1", "1:5", "1:5:1"] {
            let ticket = session.begin(&NavKey::new(key));
            assert!(ticket.generation > last);
            assert!(session.is_current(ticket.generation));
            assert_eq!(session.generation(), ticket.generation);
            last = ticket.generation;
        }
    }
}
