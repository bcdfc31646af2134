use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0a9d42-6c1b-5e8f-9b77-21d4c05a8e13").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            origin: Point::new(x, y),
            size: Size::new(width, height),
        }
    }

    pub fn max_y(&self) -> f32 {
        self.origin.y + self.size.height
    }
}

/// Reserved location meaning "no match"; never a valid document offset.
pub const NOT_FOUND: usize = usize::MAX;

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error("range end overflows at location {location} with length {length}")]
    Overflow { location: usize, length: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterRange {
    pub location: usize,
    pub length: usize,
}

impl CharacterRange {
    pub fn new(location: usize, length: usize) -> Result<Self, RangeError> {
        if location != NOT_FOUND && location.checked_add(length).is_none() {
            return Err(RangeError::Overflow { location, length });
        }
        Ok(Self { location, length })
    }

    /// Zero-length range at a caret position.
    pub fn caret(location: usize) -> Self {
        Self {
            location,
            length: 0,
        }
    }

    pub fn not_found() -> Self {
        Self {
            location: NOT_FOUND,
            length: 0,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.location == NOT_FOUND
    }

    pub fn end(&self) -> usize {
        self.location.saturating_add(self.length)
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.location && offset < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphRange {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Insets {
    pub top: f32,
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
}

impl Default for Insets {
    fn default() -> Self {
        Self {
            top: 72.0,
            left: 72.0,
            bottom: 72.0,
            right: 72.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("character width must be positive, got {0}")]
    CharWidth(f32),
    #[error("line height must be positive, got {0}")]
    LineHeight(f32),
    #[error("pages must hold at least one line")]
    LinesPerPage,
    #[error("pages must hold at least one column")]
    Columns,
}

/// Metrics the preview renders with. Screenplay pages are fixed-pitch, so a
/// handful of numbers fully determines page geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    pub char_width: f32,
    pub line_height: f32,
    pub columns: usize,
    pub lines_per_page: usize,
    pub margin: Insets,
    pub page_gap: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            char_width: 7.2,
            line_height: 12.0,
            columns: 65,
            lines_per_page: 55,
            margin: Insets::default(),
            page_gap: 20.0,
        }
    }
}

impl RenderSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.char_width > 0.0) {
            return Err(SettingsError::CharWidth(self.char_width));
        }
        if !(self.line_height > 0.0) {
            return Err(SettingsError::LineHeight(self.line_height));
        }
        if self.lines_per_page == 0 {
            return Err(SettingsError::LinesPerPage);
        }
        if self.columns == 0 {
            return Err(SettingsError::Columns);
        }
        Ok(())
    }

    pub fn page_width(&self) -> f32 {
        self.margin.left + self.columns as f32 * self.char_width + self.margin.right
    }

    pub fn page_height(&self) -> f32 {
        self.margin.top + self.lines_per_page as f32 * self.line_height + self.margin.bottom
    }

    pub fn text_width(&self) -> f32 {
        self.columns as f32 * self.char_width
    }
}

/// One rendered line of a page: the absolute document span it was taken from
/// and where that span landed in the page-local text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    pub source: CharacterRange,
    pub local: CharacterRange,
}

/// One rendered unit of the document. The represented range covers the page's
/// whole slice of the document, including offsets consumed by the page break
/// itself; only the line spans are actually rendered.
#[derive(Debug, Clone)]
pub struct Page {
    represented_range: CharacterRange,
    lines: Vec<LineSpan>,
}

impl Page {
    pub fn new(represented_range: CharacterRange, lines: Vec<LineSpan>) -> Self {
        Self {
            represented_range,
            lines,
        }
    }

    pub fn represented_range(&self) -> CharacterRange {
        self.represented_range
    }

    pub fn lines(&self) -> &[LineSpan] {
        &self.lines
    }

    /// Translates an absolute document offset into the page-local range of the
    /// rendered line containing it. Offsets inside the represented range that
    /// no line renders (the page-break newline) yield the not-found sentinel.
    pub fn range_for_location(&self, location: usize) -> CharacterRange {
        for line in &self.lines {
            if line.source.contains(location) {
                return line.local;
            }
        }
        CharacterRange::not_found()
    }
}

/// Ordered pages produced by one pagination pass. Replaced wholesale on
/// reload; never patched incrementally.
#[derive(Debug, Clone, Default)]
pub struct PaginationResult {
    pages: Vec<Page>,
}

impl PaginationResult {
    pub fn new(pages: Vec<Page>) -> Self {
        Self { pages }
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn get(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Per-page geometry queries, backed by whatever laid the page out.
pub trait PageLayout: Send + Sync {
    fn glyph_range(&self, chars: CharacterRange) -> GlyphRange;

    /// Bounding rectangle of a glyph range within the page's text container.
    /// `None` means the layout cannot answer; callers abort the attempt.
    fn bounding_rect(&self, glyphs: GlyphRange) -> Option<Rect>;
}

/// The visual container for one page. Holds an index into the current
/// pagination result rather than the page itself; page lifetime is governed
/// solely by the result's replacement on reload.
#[derive(Clone)]
pub struct PageView {
    pub page_index: usize,
    pub frame: Rect,
    pub text_origin: Point,
    pub layout: Arc<dyn PageLayout>,
}

pub trait PageViewBuilder: Send + Sync {
    fn build(&self, index: usize, page: &Page, settings: &RenderSettings) -> PageView;
}

/// A zoomable, scrollable canvas. The core reads magnification and the
/// content frame and writes the visible origin; everything else is the
/// surface's business.
pub trait ScrollSurface: Send + Sync {
    fn magnification(&self) -> f32;
    fn content_frame(&self) -> Rect;
    fn set_bounds_origin(&self, origin: Point);
}

pub trait Paginator: Send + Sync {
    fn paginate(&self, text: &str, settings: &RenderSettings) -> Result<PaginationResult>;
}

#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub id: DocumentId,
    pub path: PathBuf,
    pub text: String,
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<DocumentSource>>;
}

#[derive(Default)]
pub struct PageViewStore {
    views: Vec<PageView>,
}

impl PageViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn views(&self) -> &[PageView] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Discards the displayed views and rebuilds them from the new pages.
    pub fn rebuild(
        &mut self,
        pagination: &PaginationResult,
        settings: &RenderSettings,
        builder: &dyn PageViewBuilder,
    ) {
        self.views.clear();
        for (index, page) in pagination.pages().iter().enumerate() {
            self.views.push(builder.build(index, page, settings));
        }
        debug!(views = self.views.len(), "rebuilt page views");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviewEvent {
    PaginationReplaced { pages: usize },
    ScrolledToRange { page_index: usize, origin_y: f32 },
    RedrawNeeded,
}

/// The capability set a preview surface exposes to the surrounding editor.
/// `ViewportController` is the windowed, page-based variant; a lazily loaded
/// data-source variant would implement the same pair.
pub trait PreviewSurface {
    fn reload(&mut self, pagination: PaginationResult, settings: &RenderSettings);
    fn scroll_to_range(&mut self, range: CharacterRange);
}

/// Orchestrates page lookup, geometry resolution and scroll positioning for
/// the paged preview. Stateless across calls apart from the changed-page
/// bookkeeping and the event log drained by the redraw plumbing.
pub struct ViewportController {
    pagination: PaginationResult,
    store: PageViewStore,
    builder: Arc<dyn PageViewBuilder>,
    surface: Arc<dyn ScrollSurface>,
    changed_indices: BTreeSet<usize>,
    events: Vec<PreviewEvent>,
}

impl ViewportController {
    pub fn new(builder: Arc<dyn PageViewBuilder>, surface: Arc<dyn ScrollSurface>) -> Self {
        Self {
            pagination: PaginationResult::default(),
            store: PageViewStore::new(),
            builder,
            surface,
            changed_indices: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    pub fn pagination(&self) -> &PaginationResult {
        &self.pagination
    }

    pub fn page_views(&self) -> &[PageView] {
        self.store.views()
    }

    pub fn mark_changed(&mut self, page_index: usize) {
        if self.changed_indices.insert(page_index) {
            self.events.push(PreviewEvent::RedrawNeeded);
        }
    }

    pub fn take_changed(&mut self) -> BTreeSet<usize> {
        std::mem::take(&mut self.changed_indices)
    }

    pub fn drain_events(&mut self) -> Vec<PreviewEvent> {
        std::mem::take(&mut self.events)
    }

    /// Installs a fresh pagination result, replacing the displayed page views
    /// wholesale. An empty result simply yields zero views.
    #[instrument(skip(self, pagination, settings), fields(pages = pagination.len()))]
    pub fn reload(&mut self, pagination: PaginationResult, settings: &RenderSettings) {
        self.store.rebuild(&pagination, settings, self.builder.as_ref());
        self.pagination = pagination;
        self.changed_indices.clear();
        self.events.push(PreviewEvent::PaginationReplaced {
            pages: self.pagination.len(),
        });
    }

    /// Scrolls the viewport so the line containing `target.location` sits
    /// vertically centered, anchored at its bottom edge. Best effort: every
    /// failure mode is a silent no-op.
    #[instrument(skip(self))]
    pub fn scroll_to_range(&mut self, target: CharacterRange) {
        for view in self.store.views() {
            let Some(page) = self.pagination.get(view.page_index) else {
                continue;
            };

            if !page.represented_range().contains(target.location) {
                continue;
            }

            // Ask the page for the range in its rendered text.
            let local = page.range_for_location(target.location);
            if local.is_not_found() {
                continue;
            }

            let glyphs = view.layout.glyph_range(local);
            let Some(rect) = view.layout.bounding_rect(glyphs) else {
                warn!(
                    page = view.page_index,
                    "layout produced no bounding rect, aborting scroll"
                );
                return;
            };

            let line_position = view.frame.origin.y + view.text_origin.y + rect.origin.y;
            let viewport_height =
                self.surface.content_frame().size.height * (1.0 / self.surface.magnification());

            let origin = Point::new(0.0, line_position + rect.size.height - viewport_height / 2.0);
            self.surface.set_bounds_origin(origin);
            self.events.push(PreviewEvent::ScrolledToRange {
                page_index: view.page_index,
                origin_y: origin.y,
            });
            debug!(page = view.page_index, y = origin.y, "scrolled to range");
            return;
        }
        debug!(location = target.location, "no page represents the location");
    }
}

impl PreviewSurface for ViewportController {
    fn reload(&mut self, pagination: PaginationResult, settings: &RenderSettings) {
        ViewportController::reload(self, pagination, settings);
    }

    fn scroll_to_range(&mut self, range: CharacterRange) {
        ViewportController::scroll_to_range(self, range);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPreviewState {
    pub magnification: f32,
    pub visible_origin_y: f32,
}

impl Default for PersistedPreviewState {
    fn default() -> Self {
        Self {
            magnification: 1.0,
            visible_origin_y: 0.0,
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, id: &DocumentId) -> Result<Option<PersistedPreviewState>>;
    fn save(&self, id: &DocumentId, state: &PersistedPreviewState) -> Result<()>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, id: &DocumentId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, id: &DocumentId) -> Result<Option<PersistedPreviewState>> {
        let path = self.state_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let mut file =
            File::open(&path).with_context(|| format!("failed to open state file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let state = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        Ok(Some(state))
    }

    fn save(&self, id: &DocumentId, state: &PersistedPreviewState) -> Result<()> {
        let path = self.state_path(id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(state)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

pub struct MemoryStateStore {
    inner: Mutex<std::collections::HashMap<DocumentId, PersistedPreviewState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, id: &DocumentId) -> Result<Option<PersistedPreviewState>> {
        Ok(self.inner.lock().get(id).cloned())
    }

    fn save(&self, id: &DocumentId, state: &PersistedPreviewState) -> Result<()> {
        self.inner.lock().insert(*id, state.clone());
        Ok(())
    }
}
