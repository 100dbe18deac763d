use anyhow::Result;
use tracing::debug;
use versemap_core::{
    Book, CatalogIndex, ChapterView, NavKey, NavState, PageDirection, VolumeId,
};

/// The three addressable output regions. These are logical targets; a
/// sink decides what "primary view" means on its medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    PrimaryView,
    SecondaryView,
    Breadcrumb,
}

pub trait RenderSink {
    fn write_region(&mut self, region: Region, markup: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn region(self) -> Region {
        match self {
            Slot::A => Region::PrimaryView,
            Slot::B => Region::SecondaryView,
        }
    }
}

/// Navigation keys wired to the paging controls of the displayed
/// chapter. A missing side means that control is omitted.
#[derive(Debug, Clone, Default)]
pub struct PagingControls {
    pub previous: Option<NavKey>,
    pub next: Option<NavKey>,
}

/// An in-flight slide hand-off. The active flag stays untouched and
/// the navigation key is not committed until `complete_page` runs, so
/// the committed key can never get ahead of what is displayed.
#[derive(Debug, Clone)]
pub struct Transition {
    pub direction: PageDirection,
    commit_key: NavKey,
}

impl Transition {
    pub fn commit_key(&self) -> &NavKey {
        &self.commit_key
    }
}

/// Owns the two render slots and the active flag; all slot writes go
/// through here.
pub struct ViewBuffers {
    active: Slot,
    controls: PagingControls,
}

impl ViewBuffers {
    pub fn new() -> Self {
        Self {
            active: Slot::A,
            controls: PagingControls::default(),
        }
    }

    pub fn active(&self) -> Slot {
        self.active
    }

    /// Table-of-contents style content replaces the active slot and
    /// drops any chapter paging state.
    pub fn show_static(&mut self, sink: &mut dyn RenderSink, markup: &str) -> Result<()> {
        self.controls = PagingControls::default();
        sink.write_region(self.active.region(), markup)
    }

    /// Writes the current chapter (with its paging controls) into the
    /// active slot and the prefetched neighbor, if any, into the
    /// inactive slot.
    pub fn show_chapter(&mut self, sink: &mut dyn RenderSink, view: &ChapterView) -> Result<()> {
        self.controls = PagingControls {
            previous: view.previous.as_ref().map(|r| r.nav_key()),
            next: view.next.as_ref().map(|r| r.nav_key()),
        };
        let markup = chapter_markup(view, &self.controls);
        sink.write_region(self.active.region(), &markup)?;

        let standby = match &view.neighbor {
            Some(neighbor) => neighbor.content.clone(),
            None => String::new(),
        };
        sink.write_region(self.active.other().region(), &standby)?;
        debug!(slot = ?self.active, chapter = %view.current.title, "chapter presented");
        Ok(())
    }

    /// Begins a slide toward the requested neighbor. Returns `None`
    /// when that side has no chapter (the control is absent).
    pub fn start_page(&self, direction: PageDirection) -> Option<Transition> {
        let commit_key = match direction {
            PageDirection::Forward => self.controls.next.clone()?,
            PageDirection::Backward => self.controls.previous.clone()?,
        };
        Some(Transition {
            direction,
            commit_key,
        })
    }

    /// Finishes the slide: the incoming slot becomes active and the
    /// caller receives the key to commit for the newly shown chapter.
    pub fn complete_page(&mut self, transition: Transition) -> NavKey {
        self.active = self.active.other();
        debug!(slot = ?self.active, key = %transition.commit_key, "page flip committed");
        transition.commit_key
    }
}

impl Default for ViewBuffers {
    fn default() -> Self {
        Self::new()
    }
}

fn paging_controls_markup(controls: &PagingControls) -> String {
    let mut markup = String::new();
    if controls.previous.is_none() && controls.next.is_none() {
        return markup;
    }
    markup.push_str("<div class=\"paging\">");
    if let Some(previous) = &controls.previous {
        markup.push_str(&format!(
            "<a class=\"btn\" id=\"previousbtn\" href=\"#{}\">previous</a>",
            previous
        ));
    }
    if let Some(next) = &controls.next {
        markup.push_str(&format!(
            "<a class=\"btn\" id=\"nextbtn\" href=\"#{}\">next</a>",
            next
        ));
    }
    markup.push_str("</div>");
    markup
}

/// Chapter body with its paging controls; a chapter with no neighbor
/// on either side renders as a terminal page with no controls.
pub fn chapter_markup(view: &ChapterView, controls: &PagingControls) -> String {
    format!("{}{}", paging_controls_markup(controls), view.content)
}

fn book_grid_entry(volume_id: VolumeId, book: &Book) -> String {
    // Single-page books link straight to their one page.
    let key = if book.is_single_page() {
        NavKey::chapter(volume_id, book.id, 0)
    } else {
        NavKey::book(volume_id, book.id)
    };
    format!(
        "<a class=\"btn\" id=\"{}\" href=\"#{}\">{}</a>",
        book.id, key, book.grid_name
    )
}

/// Home grid: every volume with its books, or a single volume's
/// section when one is selected.
pub fn home_markup(catalog: &CatalogIndex, selected: Option<VolumeId>) -> String {
    let mut markup = String::from("<div id=\"navgrid\">");
    for volume in catalog.volumes() {
        if let Some(selected) = selected {
            if volume.id != selected {
                continue;
            }
        }
        markup.push_str(&format!(
            "<div class=\"volume\"><h3>{}</h3><div class=\"books\">",
            volume.full_name
        ));
        for book in &volume.books {
            markup.push_str(&book_grid_entry(volume.id, book));
        }
        markup.push_str("</div></div>");
    }
    markup.push_str("</div>");
    markup
}

/// Chapter grid for one book.
pub fn book_toc_markup(catalog: &CatalogIndex, book: &Book) -> String {
    let volume_name = catalog
        .volume_of(book)
        .map(|v| v.full_name.as_str())
        .unwrap_or_default();
    let mut markup = format!(
        "<div id=\"navgrid\"><h1>{}</h1><div class=\"volume\"><h3>{}</h3></div><div class=\"books\">",
        volume_name, book.full_name
    );
    if book.is_single_page() {
        let key = NavKey::chapter(book.parent_volume_id, book.id, 0);
        markup.push_str(&format!(
            "<a class=\"btn\" id=\"0\" href=\"#{}\">{}</a>",
            key, book.grid_name
        ));
    } else {
        for chapter in 1..=book.num_chapters {
            let key = NavKey::chapter(book.parent_volume_id, book.id, chapter);
            markup.push_str(&format!(
                "<a class=\"btn\" id=\"{}\" href=\"#{}\">Chapter {}</a>",
                chapter, key, chapter
            ));
        }
    }
    markup.push_str("</div></div>");
    markup
}

/// Breadcrumb trail for the resolved state: one link per ancestor
/// level, with the current level unlinked.
pub fn breadcrumb_trail(catalog: &CatalogIndex, state: NavState) -> String {
    const ROOT: &str = "The Library";
    let mut crumbs = String::from("<ul>");
    match state {
        NavState::Home => {
            crumbs.push_str(&format!("<li>{}</li>", ROOT));
        }
        NavState::VolumeToc(volume_id) => {
            crumbs.push_str(&format!("<li><a href=\"#\">{}</a></li>", ROOT));
            if let Some(volume) = catalog.volume(volume_id) {
                crumbs.push_str(&format!("<li>{}</li>", volume.full_name));
            }
        }
        NavState::BookToc(book_id) => {
            crumbs.push_str(&format!("<li><a href=\"#\">{}</a></li>", ROOT));
            if let Some(book) = catalog.book(book_id) {
                if let Some(volume) = catalog.volume_of(book) {
                    crumbs.push_str(&format!(
                        "<li><a href=\"#{}\">{}</a></li>",
                        NavKey::volume(volume.id),
                        volume.full_name
                    ));
                }
                crumbs.push_str(&format!("<li>{}</li>", book.toc_name));
            }
        }
        NavState::Chapter { book_id, chapter } => {
            crumbs.push_str(&format!("<li><a href=\"#\">{}</a></li>", ROOT));
            if let Some(book) = catalog.book(book_id) {
                if let Some(volume) = catalog.volume_of(book) {
                    crumbs.push_str(&format!(
                        "<li><a href=\"#{}\">{}</a></li>",
                        NavKey::volume(volume.id),
                        volume.full_name
                    ));
                }
                if chapter > 0 {
                    crumbs.push_str(&format!(
                        "<li><a href=\"#{}\">{}</a></li>",
                        NavKey::book(book.parent_volume_id, book.id),
                        book.toc_name
                    ));
                    crumbs.push_str(&format!("<li>{}</li>", chapter));
                } else {
                    crumbs.push_str(&format!("<li>{}</li>", book.toc_name));
                }
            }
        }
    }
    crumbs.push_str("</ul>");
    crumbs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use versemap_core::{ChapterRef, NeighborContent, Volume};

    fn book(id: u32, volume: u32, toc_name: &str, num_chapters: u32) -> Book {
        Book {
            id,
            parent_volume_id: volume,
            full_name: format!("The Book of {}", toc_name),
            toc_name: toc_name.to_string(),
            grid_name: toc_name.to_string(),
            num_chapters,
        }
    }

    fn sample_catalog() -> CatalogIndex {
        let books = [book(1, 1, "Alpha", 3), book(2, 1, "Beta", 0)]
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        let volumes = vec![Volume {
            id: 1,
            full_name: "First Collection".to_string(),
            toc_name: "First".to_string(),
            min_book_id: 1,
            max_book_id: 2,
            books: Vec::new(),
        }];
        CatalogIndex::from_parts(books, volumes).unwrap()
    }

    fn chapter_ref(book_id: u32, chapter: u32, title: &str) -> ChapterRef {
        ChapterRef {
            volume_id: 1,
            book_id,
            chapter,
            title: title.to_string(),
        }
    }

    fn view_with_neighbors(
        previous: Option<ChapterRef>,
        next: Option<ChapterRef>,
        neighbor: Option<NeighborContent>,
    ) -> ChapterView {
        ChapterView {
            current: chapter_ref(1, 2, "Alpha 2"),
            content: "<p>alpha two</p>".to_string(),
            previous,
            next,
            neighbor,
        }
    }

    #[derive(Default)]
    struct FakeSink {
        regions: HashMap<Region, String>,
        writes: Vec<(Region, String)>,
    }

    impl RenderSink for FakeSink {
        fn write_region(&mut self, region: Region, markup: &str) -> Result<()> {
            self.regions.insert(region, markup.to_string());
            self.writes.push((region, markup.to_string()));
            Ok(())
        }
    }

    #[test]
    fn chapter_goes_to_active_slot_neighbor_to_inactive() {
        let mut buffers = ViewBuffers::new();
        let mut sink = FakeSink::default();
        let view = view_with_neighbors(
            Some(chapter_ref(1, 1, "Alpha 1")),
            Some(chapter_ref(1, 3, "Alpha 3")),
            Some(NeighborContent {
                target: chapter_ref(1, 3, "Alpha 3"),
                direction: PageDirection::Forward,
                content: "<p>alpha three</p>".to_string(),
            }),
        );
        buffers.show_chapter(&mut sink, &view).unwrap();

        let primary = &sink.regions[&Region::PrimaryView];
        assert!(primary.contains("alpha two"));
        assert!(primary.contains("previousbtn"));
        assert!(primary.contains("nextbtn"));
        assert_eq!(sink.regions[&Region::SecondaryView], "<p>alpha three</p>");
    }

    #[test]
    fn flip_swaps_active_slot_and_returns_commit_key() {
        let mut buffers = ViewBuffers::new();
        let mut sink = FakeSink::default();
        let view = view_with_neighbors(
            Some(chapter_ref(1, 1, "Alpha 1")),
            Some(chapter_ref(1, 3, "Alpha 3")),
            None,
        );
        buffers.show_chapter(&mut sink, &view).unwrap();
        assert_eq!(buffers.active(), Slot::A);

        let transition = buffers.start_page(PageDirection::Forward).unwrap();
        // Nothing is committed and nothing flips until completion.
        assert_eq!(buffers.active(), Slot::A);
        assert_eq!(transition.commit_key().as_str(), "1:1:3");

        let key = buffers.complete_page(transition);
        assert_eq!(buffers.active(), Slot::B);
        assert_eq!(key.as_str(), "1:1:3");

        // The next chapter render lands in the new active slot.
        buffers.show_chapter(&mut sink, &view).unwrap();
        let (region, _) = sink.writes[sink.writes.len() - 2].clone();
        assert_eq!(region, Region::SecondaryView);
    }

    #[test]
    fn missing_neighbor_omits_control_and_refuses_page() {
        let mut buffers = ViewBuffers::new();
        let mut sink = FakeSink::default();
        let view = view_with_neighbors(None, Some(chapter_ref(1, 3, "Alpha 3")), None);
        buffers.show_chapter(&mut sink, &view).unwrap();

        let primary = &sink.regions[&Region::PrimaryView];
        assert!(!primary.contains("previousbtn"));
        assert!(primary.contains("nextbtn"));
        assert!(buffers.start_page(PageDirection::Backward).is_none());
        assert!(buffers.start_page(PageDirection::Forward).is_some());
    }

    #[test]
    fn no_neighbors_renders_terminal_layout() {
        let mut buffers = ViewBuffers::new();
        let mut sink = FakeSink::default();
        let view = view_with_neighbors(None, None, None);
        buffers.show_chapter(&mut sink, &view).unwrap();

        let primary = &sink.regions[&Region::PrimaryView];
        assert!(!primary.contains("paging"));
        assert!(primary.contains("alpha two"));
        assert!(buffers.start_page(PageDirection::Forward).is_none());
        assert!(buffers.start_page(PageDirection::Backward).is_none());
    }

    #[test]
    fn static_content_clears_paging_state() {
        let mut buffers = ViewBuffers::new();
        let mut sink = FakeSink::default();
        let view = view_with_neighbors(
            Some(chapter_ref(1, 1, "Alpha 1")),
            Some(chapter_ref(1, 3, "Alpha 3")),
            None,
        );
        buffers.show_chapter(&mut sink, &view).unwrap();
        buffers.show_static(&mut sink, "<div>home</div>").unwrap();

        assert_eq!(sink.regions[&Region::PrimaryView], "<div>home</div>");
        assert!(buffers.start_page(PageDirection::Forward).is_none());
    }

    #[test]
    fn home_markup_links_single_page_books_to_their_page() {
        let catalog = sample_catalog();
        let markup = home_markup(&catalog, None);
        assert!(markup.contains("href=\"#1:1\""));
        assert!(markup.contains("href=\"#1:2:0\""));
        assert!(markup.contains("First Collection"));
    }

    #[test]
    fn home_markup_with_selection_shows_one_volume() {
        let catalog = sample_catalog();
        let markup = home_markup(&catalog, Some(1));
        assert!(markup.contains("First Collection"));
        let none = home_markup(&catalog, Some(9));
        assert!(!none.contains("First Collection"));
    }

    #[test]
    fn book_toc_lists_every_chapter() {
        let catalog = sample_catalog();
        let markup = book_toc_markup(&catalog, catalog.book(1).unwrap());
        for chapter in 1..=3 {
            assert!(markup.contains(&format!("href=\"#1:1:{}\"", chapter)));
        }
    }

    #[test]
    fn breadcrumbs_per_state() {
        let catalog = sample_catalog();
        assert_eq!(
            breadcrumb_trail(&catalog, NavState::Home),
            "<ul><li>The Library</li></ul>"
        );

        let volume = breadcrumb_trail(&catalog, NavState::VolumeToc(1));
        assert!(volume.contains("<li>First Collection</li>"));

        let book = breadcrumb_trail(&catalog, NavState::BookToc(1));
        assert!(book.contains("href=\"#1\""));
        assert!(book.contains("<li>Alpha</li>"));

        let chapter = breadcrumb_trail(
            &catalog,
            NavState::Chapter {
                book_id: 1,
                chapter: 2,
            },
        );
        assert!(chapter.contains("href=\"#1:1\""));
        assert!(chapter.contains("<li>2</li>"));

        // A single-page book's chapter 0 leaves the book unlinked.
        let page = breadcrumb_trail(
            &catalog,
            NavState::Chapter {
                book_id: 2,
                chapter: 0,
            },
        );
        assert!(page.contains("<li>Beta</li>"));
        assert!(!page.contains("<li>0</li>"));
    }
}
