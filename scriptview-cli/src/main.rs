use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use scriptview_core::{
    CharacterRange, DocumentProvider, FileStateStore, PaginationResult, Paginator, Point,
    PreviewEvent, RenderSettings, ScrollSurface, Size, StateStore, ViewportController,
};
use scriptview_layout::{
    FileDocumentProvider, LinePaginator, MonospacePageViewBuilder, VirtualScrollSurface,
};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "scriptview",
    version,
    about = "paginated screenplay preview inspector"
)]
struct Args {
    /// Screenplay source file (UTF-8 text)
    file: PathBuf,

    /// Document offset to scroll the preview to
    #[arg(short, long)]
    location: Option<usize>,

    /// Length of the target range
    #[arg(long, default_value_t = 0)]
    length: usize,

    /// Viewport magnification, clamped to the supported zoom range
    #[arg(short, long)]
    magnification: Option<f32>,

    /// Viewport height in points
    #[arg(long, default_value_t = 800.0)]
    viewport_height: f32,

    /// Print the pagination table instead of resolving a range
    #[arg(long)]
    pages: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "scriptview", "scriptview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let settings = load_settings(&project_dirs)?;
    settings.validate()?;

    let provider = FileDocumentProvider::new();
    let source = provider
        .open(&args.file)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;

    let pagination = LinePaginator::new().paginate(&source.text, &settings)?;

    if args.pages {
        print_pages(&pagination);
        return Ok(());
    }

    let state_dir = project_dirs.data_local_dir().join("state");
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
    let mut state = store.load(&source.id)?.unwrap_or_default();

    let surface = Arc::new(VirtualScrollSurface::new(Size::new(
        settings.page_width(),
        args.viewport_height,
    )));
    surface.set_magnification(args.magnification.unwrap_or(state.magnification));
    surface.set_bounds_origin(Point::new(0.0, state.visible_origin_y));

    let mut controller = ViewportController::new(
        Arc::new(MonospacePageViewBuilder::new()),
        Arc::clone(&surface) as Arc<dyn ScrollSurface>,
    );
    controller.reload(pagination, &settings);

    if let Some(location) = args.location {
        let target = CharacterRange::new(location, args.length)?;
        controller.scroll_to_range(target);

        let scrolled = controller.drain_events().into_iter().find_map(|e| match e {
            PreviewEvent::ScrolledToRange {
                page_index,
                origin_y,
            } => Some((page_index, origin_y)),
            _ => None,
        });
        // A failed scroll is not an error, merely "nothing happened".
        match scrolled {
            Some((page, y)) => println!(
                "location {} resolved on page {} (visible origin y = {:.1})",
                location,
                page + 1,
                y
            ),
            None => println!("location {} did not resolve; viewport unchanged", location),
        }
    } else {
        println!(
            "{} pages at {:.0}% magnification",
            controller.pagination().len(),
            surface.magnification() * 100.0
        );
    }

    state.magnification = surface.magnification();
    state.visible_origin_y = surface.visible_origin().y;
    if let Err(err) = store.save(&source.id, &state) {
        warn!(?err, "failed to persist preview state");
    }

    Ok(())
}

fn print_pages(pagination: &PaginationResult) {
    for (index, page) in pagination.pages().iter().enumerate() {
        let range = page.represented_range();
        println!(
            "page {:>3}: chars {}..{} ({} lines)",
            index + 1,
            range.location,
            range.end(),
            page.lines().len()
        );
    }
    if pagination.is_empty() {
        println!("no pages (empty source)");
    }
}

fn load_settings(project_dirs: &ProjectDirs) -> Result<RenderSettings> {
    let path = project_dirs.config_dir().join("settings.toml");
    if !path.exists() {
        return Ok(RenderSettings::default());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read settings file {:?}", path))?;
    let settings = toml::from_str(&raw)
        .with_context(|| format!("failed to decode settings file {:?}", path))?;
    Ok(settings)
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "scriptview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .init();

    Ok(guard)
}
