use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use scriptview_core::{
    document_id_for_path, CharacterRange, DocumentProvider, DocumentSource, GlyphRange, LineSpan,
    Page, PageLayout, PageView, PageViewBuilder, Paginator, PaginationResult, Point, Rect,
    RenderSettings, ScrollSurface, Size,
};
use tracing::{debug, instrument};

pub const MIN_MAGNIFICATION: f32 = 0.25;
pub const MAX_MAGNIFICATION: f32 = 4.0;

/// Geometry queries over one page of fixed-pitch text. Glyphs map 1:1 to
/// characters, so all the layout needs is where each rendered line starts in
/// the page-local text.
pub struct MonospaceLayout {
    char_width: f32,
    line_height: f32,
    text_width: f32,
    line_starts: Vec<usize>,
    text_len: usize,
}

impl MonospaceLayout {
    pub fn new(settings: &RenderSettings, line_starts: Vec<usize>, text_len: usize) -> Self {
        Self {
            char_width: settings.char_width,
            line_height: settings.line_height,
            text_width: settings.text_width(),
            line_starts,
            text_len,
        }
    }

    fn row_of(&self, offset: usize) -> usize {
        self.line_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1)
    }
}

impl PageLayout for MonospaceLayout {
    fn glyph_range(&self, chars: CharacterRange) -> GlyphRange {
        GlyphRange {
            start: chars.location,
            len: chars.length,
        }
    }

    fn bounding_rect(&self, glyphs: GlyphRange) -> Option<Rect> {
        if self.line_starts.is_empty() || glyphs.start > self.text_len {
            return None;
        }

        let start_row = self.row_of(glyphs.start);
        let last_offset = if glyphs.len > 0 {
            glyphs.start + glyphs.len - 1
        } else {
            glyphs.start
        };
        let end_row = self.row_of(last_offset.min(self.text_len));

        let y = start_row as f32 * self.line_height;
        let height = (end_row - start_row + 1) as f32 * self.line_height;

        if start_row == end_row {
            let col = glyphs.start - self.line_starts[start_row];
            let x = col as f32 * self.char_width;
            let width = glyphs.len as f32 * self.char_width;
            Some(Rect::new(x, y, width, height))
        } else {
            // A span crossing rows occupies the full text column.
            Some(Rect::new(0.0, y, self.text_width, height))
        }
    }
}

/// Packs a fixed number of source lines onto each page. The newline that ends
/// a page is consumed by the page break: it belongs to the page's represented
/// range but is not rendered, so offsets pointing at it do not resolve.
pub struct LinePaginator;

impl LinePaginator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinePaginator {
    fn default() -> Self {
        Self::new()
    }
}

struct RawLine {
    start: usize,
    content_len: usize,
    has_newline: bool,
}

fn scan_lines(text: &str) -> Vec<RawLine> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for segment in text.split_inclusive('\n') {
        let has_newline = segment.ends_with('\n');
        let content_len = segment.len() - usize::from(has_newline);
        lines.push(RawLine {
            start: offset,
            content_len,
            has_newline,
        });
        offset += segment.len();
    }
    lines
}

impl Paginator for LinePaginator {
    #[instrument(skip(self, text), fields(bytes = text.len()))]
    fn paginate(&self, text: &str, settings: &RenderSettings) -> Result<PaginationResult> {
        settings.validate()?;

        let lines = scan_lines(text);
        if lines.is_empty() {
            return Ok(PaginationResult::default());
        }

        let mut pages = Vec::new();
        for chunk in lines.chunks(settings.lines_per_page) {
            let page_start = chunk[0].start;
            let mut spans = Vec::with_capacity(chunk.len());
            let mut local_cursor = 0;

            for (idx, line) in chunk.iter().enumerate() {
                let is_last_on_page = idx == chunk.len() - 1;
                // Interior newlines are rendered with their line; the page's
                // trailing newline is not.
                let rendered_len = if line.has_newline && !is_last_on_page {
                    line.content_len + 1
                } else {
                    line.content_len
                };
                spans.push(LineSpan {
                    source: CharacterRange::new(line.start, rendered_len)?,
                    local: CharacterRange::new(local_cursor, rendered_len)?,
                });
                local_cursor += rendered_len;
            }

            let last = &chunk[chunk.len() - 1];
            let page_end = last.start + last.content_len + usize::from(last.has_newline);
            let represented = CharacterRange::new(page_start, page_end - page_start)?;
            pages.push(Page::new(represented, spans));
        }

        debug!(pages = pages.len(), "paginated source");
        Ok(PaginationResult::new(pages))
    }
}

/// Stacks page frames vertically and places each text container at the margin
/// origin, the way the preview column presents them.
pub struct MonospacePageViewBuilder;

impl MonospacePageViewBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MonospacePageViewBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PageViewBuilder for MonospacePageViewBuilder {
    fn build(&self, index: usize, page: &Page, settings: &RenderSettings) -> PageView {
        let y = index as f32 * (settings.page_height() + settings.page_gap);
        let frame = Rect::new(0.0, y, settings.page_width(), settings.page_height());
        let text_origin = Point::new(settings.margin.left, settings.margin.top);

        let line_starts = page.lines().iter().map(|l| l.local.location).collect();
        let text_len = page.lines().last().map(|l| l.local.end()).unwrap_or(0);
        let layout = Arc::new(MonospaceLayout::new(settings, line_starts, text_len));

        PageView {
            page_index: index,
            frame,
            text_origin,
            layout,
        }
    }
}

struct ScrollInner {
    magnification: f32,
    origin: Point,
    viewport: Size,
}

/// In-memory scroll state standing in for a platform scroll view. Used by the
/// CLI driver and by tests.
pub struct VirtualScrollSurface {
    inner: Mutex<ScrollInner>,
}

impl VirtualScrollSurface {
    pub fn new(viewport: Size) -> Self {
        Self {
            inner: Mutex::new(ScrollInner {
                magnification: 1.0,
                origin: Point::default(),
                viewport,
            }),
        }
    }

    pub fn set_magnification(&self, magnification: f32) {
        self.inner.lock().magnification =
            magnification.clamp(MIN_MAGNIFICATION, MAX_MAGNIFICATION);
    }

    pub fn visible_origin(&self) -> Point {
        self.inner.lock().origin
    }
}

impl ScrollSurface for VirtualScrollSurface {
    fn magnification(&self) -> f32 {
        self.inner.lock().magnification
    }

    fn content_frame(&self) -> Rect {
        let inner = self.inner.lock();
        Rect {
            origin: inner.origin,
            size: inner.viewport,
        }
    }

    fn set_bounds_origin(&self, origin: Point) {
        self.inner.lock().origin = origin;
    }
}

/// Reads UTF-8 screenplay sources from disk.
pub struct FileDocumentProvider;

impl FileDocumentProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileDocumentProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentProvider for FileDocumentProvider {
    async fn open(&self, path: &Path) -> Result<Arc<DocumentSource>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {:?}", path))?;
        Ok(Arc::new(DocumentSource {
            id: document_id_for_path(path),
            path: path.to_path_buf(),
            text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptview_core::ViewportController;

    fn bare_settings() -> RenderSettings {
        RenderSettings {
            char_width: 10.0,
            line_height: 10.0,
            columns: 10,
            lines_per_page: 2,
            margin: scriptview_core::Insets {
                top: 0.0,
                left: 0.0,
                bottom: 0.0,
                right: 0.0,
            },
            page_gap: 0.0,
        }
    }

    #[test]
    fn paginator_partitions_offsets_contiguously() {
        let text = "aaaa\nbbbb\ncccc\ndddd\n";
        let result = LinePaginator::new()
            .paginate(text, &bare_settings())
            .unwrap();

        assert_eq!(result.len(), 2);
        let first = result.get(0).unwrap().represented_range();
        let second = result.get(1).unwrap().represented_range();
        assert_eq!(first.location, 0);
        assert_eq!(first.length, 10);
        assert_eq!(second.location, 10);
        assert_eq!(second.length, 10);
        assert_eq!(second.end(), text.len());
    }

    #[test]
    fn page_break_newline_is_an_unrendered_gap() {
        let text = "aaaa\nbbbb\ncccc\n";
        let result = LinePaginator::new()
            .paginate(text, &bare_settings())
            .unwrap();
        let page = result.get(0).unwrap();

        // Offset 4 is the interior newline, rendered with line 0.
        assert_eq!(page.range_for_location(4).location, 0);
        // Offset 9 is the newline the page break consumed.
        assert!(page.represented_range().contains(9));
        assert!(page.range_for_location(9).is_not_found());
    }

    #[test]
    fn paginator_handles_missing_final_newline() {
        let text = "aaaa\nbbbb\ncc";
        let result = LinePaginator::new()
            .paginate(text, &bare_settings())
            .unwrap();

        assert_eq!(result.len(), 2);
        let last = result.get(1).unwrap();
        assert_eq!(last.represented_range().end(), text.len());
        assert_eq!(last.range_for_location(10).location, 0);
    }

    #[test]
    fn empty_source_paginates_to_zero_pages() {
        let result = LinePaginator::new().paginate("", &bare_settings()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn monospace_rect_for_single_line_span() {
        let settings = bare_settings();
        let layout = MonospaceLayout::new(&settings, vec![0, 5], 9);

        let rect = layout
            .bounding_rect(GlyphRange { start: 7, len: 2 })
            .unwrap();
        assert_eq!(rect.origin.x, 20.0);
        assert_eq!(rect.origin.y, 10.0);
        assert_eq!(rect.size.width, 20.0);
        assert_eq!(rect.size.height, 10.0);
    }

    #[test]
    fn monospace_rect_for_multi_line_span_unions_rows() {
        let settings = bare_settings();
        let layout = MonospaceLayout::new(&settings, vec![0, 5], 9);

        let rect = layout
            .bounding_rect(GlyphRange { start: 2, len: 6 })
            .unwrap();
        assert_eq!(rect.origin.x, 0.0);
        assert_eq!(rect.origin.y, 0.0);
        assert_eq!(rect.size.width, settings.text_width());
        assert_eq!(rect.size.height, 20.0);
    }

    #[test]
    fn monospace_rect_for_caret_is_zero_width() {
        let settings = bare_settings();
        let layout = MonospaceLayout::new(&settings, vec![0], 4);

        let rect = layout
            .bounding_rect(GlyphRange { start: 2, len: 0 })
            .unwrap();
        assert_eq!(rect.origin.x, 20.0);
        assert_eq!(rect.size.width, 0.0);
        assert_eq!(rect.size.height, 10.0);
    }

    #[test]
    fn monospace_rect_rejects_offsets_past_layout() {
        let settings = bare_settings();
        let layout = MonospaceLayout::new(&settings, vec![0], 4);
        assert!(layout
            .bounding_rect(GlyphRange { start: 9, len: 1 })
            .is_none());

        let empty = MonospaceLayout::new(&settings, Vec::new(), 0);
        assert!(empty
            .bounding_rect(GlyphRange { start: 0, len: 0 })
            .is_none());
    }

    #[test]
    fn builder_stacks_page_frames_with_gap() {
        let mut settings = bare_settings();
        settings.page_gap = 5.0;
        settings.margin.top = 3.0;
        settings.margin.left = 4.0;
        let text = "aaaa\nbbbb\ncccc\n";
        let result = LinePaginator::new().paginate(text, &settings).unwrap();

        let builder = MonospacePageViewBuilder::new();
        let first = builder.build(0, result.get(0).unwrap(), &settings);
        let second = builder.build(1, result.get(1).unwrap(), &settings);

        assert_eq!(first.frame.origin.y, 0.0);
        assert_eq!(second.frame.origin.y, settings.page_height() + 5.0);
        assert_eq!(first.text_origin, Point::new(4.0, 3.0));
    }

    #[test]
    fn virtual_surface_clamps_magnification() {
        let surface = VirtualScrollSurface::new(Size::new(100.0, 40.0));
        surface.set_magnification(0.01);
        assert_eq!(surface.magnification(), MIN_MAGNIFICATION);
        surface.set_magnification(10.0);
        assert_eq!(surface.magnification(), MAX_MAGNIFICATION);
        surface.set_magnification(1.5);
        assert_eq!(surface.magnification(), 1.5);
    }

    #[test]
    fn end_to_end_scroll_centers_target_line() {
        let settings = bare_settings();
        let text = "aaaa\nbbbb\ncccc\ndddd\n";
        let pagination = LinePaginator::new().paginate(text, &settings).unwrap();

        let surface = Arc::new(VirtualScrollSurface::new(Size::new(100.0, 40.0)));
        let mut controller = ViewportController::new(
            Arc::new(MonospacePageViewBuilder::new()),
            Arc::clone(&surface) as Arc<dyn ScrollSurface>,
        );
        controller.reload(pagination, &settings);

        // Offset 15 is the first 'd': page 1, second line. Line position is
        // page frame y (20) + row y (10) = 30; logical viewport height is 40.
        controller.scroll_to_range(CharacterRange::caret(15));
        let origin = surface.visible_origin();
        assert_eq!(origin.x, 0.0);
        assert_eq!(origin.y, 30.0 + 10.0 - 20.0);
    }

    #[test]
    fn end_to_end_scroll_respects_magnification() {
        let settings = bare_settings();
        let text = "aaaa\nbbbb\ncccc\ndddd\n";
        let pagination = LinePaginator::new().paginate(text, &settings).unwrap();

        let surface = Arc::new(VirtualScrollSurface::new(Size::new(100.0, 40.0)));
        surface.set_magnification(2.0);
        let mut controller = ViewportController::new(
            Arc::new(MonospacePageViewBuilder::new()),
            Arc::clone(&surface) as Arc<dyn ScrollSurface>,
        );
        controller.reload(pagination, &settings);

        controller.scroll_to_range(CharacterRange::caret(15));
        assert_eq!(surface.visible_origin().y, 30.0 + 10.0 - 10.0);
    }

    #[test]
    fn scroll_to_page_break_offset_is_noop_end_to_end() {
        let settings = bare_settings();
        let text = "aaaa\nbbbb\ncccc\ndddd\n";
        let pagination = LinePaginator::new().paginate(text, &settings).unwrap();

        let surface = Arc::new(VirtualScrollSurface::new(Size::new(100.0, 40.0)));
        let mut controller = ViewportController::new(
            Arc::new(MonospacePageViewBuilder::new()),
            Arc::clone(&surface) as Arc<dyn ScrollSurface>,
        );
        controller.reload(pagination, &settings);

        // Offset 9 is page 0's break newline.
        controller.scroll_to_range(CharacterRange::caret(9));
        assert_eq!(surface.visible_origin(), Point::default());
    }

    #[tokio::test]
    async fn provider_reads_source_with_stable_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draft.fountain");
        std::fs::write(&path, "INT. OFFICE - DAY\n").unwrap();

        let provider = FileDocumentProvider::new();
        let first = provider.open(&path).await.unwrap();
        let second = provider.open(&path).await.unwrap();

        assert_eq!(first.text, "INT. OFFICE - DAY\n");
        assert_eq!(first.id, second.id);
        assert!(provider.open(&dir.path().join("missing")).await.is_err());
    }
}
