use crate::config::Settings;
use crate::console::{ConsoleChannel, ConsoleRewards, EventSink};
use anyhow::{bail, Context, Result};
use piecemeal_core::{PieceId, Puzzle};
use piecemeal_engine::{
    ActiveDrops, CompletionDetector, DropAdmin, DropScheduler, Leaderboard, SchedulerConfig,
};
use piecemeal_render::{
    FsAssetSource, ProgressRenderer, RenderCache, RenderConfig, RenderRequest, RenderedProgress,
};
use piecemeal_storage::{DocumentStore, PieceLedger};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Every component wired against one store and the console collaborators.
pub struct App {
    pub settings: Settings,
    pub store: Arc<DocumentStore>,
    pub ledger: PieceLedger,
    pub detector: Arc<CompletionDetector>,
    pub drops: Arc<ActiveDrops>,
    pub scheduler: Arc<DropScheduler>,
    pub admin: DropAdmin,
    pub leaderboard: Leaderboard,
    pub channel: Arc<ConsoleChannel>,
    pub sink: EventSink,
    renderer: ProgressRenderer,
    renders: RenderCache,
}

impl App {
    pub fn open(settings: Settings, sink: EventSink) -> Result<Self> {
        let store = DocumentStore::open(&settings.data_path).with_context(|| {
            format!("Failed to open data file {}", settings.data_path.display())
        })?;
        Ok(Self::with_store(settings, Arc::new(store), sink))
    }

    pub fn with_store(settings: Settings, store: Arc<DocumentStore>, sink: EventSink) -> Self {
        let channel = Arc::new(ConsoleChannel::new(sink.clone()));
        let rewards = Arc::new(ConsoleRewards::new(sink.clone()));
        let ledger = PieceLedger::new(store.clone());
        let detector = Arc::new(CompletionDetector::new(store.clone(), rewards));
        let drops = Arc::new(ActiveDrops::new());
        let scheduler = Arc::new(DropScheduler::new(
            SchedulerConfig {
                tick_interval: settings.tick_interval(),
                claim_ttl: settings.claim_ttl(),
            },
            store.clone(),
            channel.clone(),
            drops.clone(),
        ));
        let admin = DropAdmin::new(ledger.clone(), detector.clone(), scheduler.clone());
        let renderer = ProgressRenderer::new(
            RenderConfig::default(),
            Arc::new(FsAssetSource::new(settings.asset_root.clone())),
        );
        Self {
            settings,
            leaderboard: Leaderboard::new(store.clone()),
            store,
            ledger,
            detector,
            drops,
            scheduler,
            admin,
            channel,
            sink,
            renderer,
            renders: RenderCache::new(),
        }
    }

    /// The user's current progress image, reused while their pieces are unchanged.
    pub fn render_progress(&self, user_id: &str, slug: &str) -> Result<Arc<RenderedProgress>> {
        let (puzzle, pieces) = self.puzzle_assets(slug)?;
        let owned = self.ledger.get_owned(user_id, slug);
        let rendered = self.renders.get_or_render(user_id, slug, &owned, || {
            self.renderer.render(&RenderRequest {
                slug,
                puzzle: &puzzle,
                pieces: &pieces,
                owned: &owned,
            })
        })?;
        Ok(rendered)
    }

    pub fn render_owned(&self, slug: &str, owned: &[PieceId]) -> Result<RenderedProgress> {
        let (puzzle, pieces) = self.puzzle_assets(slug)?;
        let owned: BTreeSet<PieceId> = owned.iter().copied().collect();
        let rendered = self.renderer.render(&RenderRequest {
            slug,
            puzzle: &puzzle,
            pieces: &pieces,
            owned: &owned,
        })?;
        Ok(rendered)
    }

    pub fn forget_render(&self, user_id: &str, slug: &str) {
        self.renders.invalidate(user_id, slug);
    }

    /// Writes the PNG to `out`, or to `<render_dir>/<default_name>`.
    pub fn write_render(
        &self,
        rendered: &RenderedProgress,
        out: Option<&Path>,
        default_name: &str,
    ) -> Result<PathBuf> {
        let path = match out {
            Some(path) => path.to_path_buf(),
            None => self.settings.render_dir.join(default_name),
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension(format!("png.{}.tmp", std::process::id()));
        fs::write(&tmp, &rendered.png)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move render into {}", path.display()))?;
        Ok(path)
    }

    fn puzzle_assets(&self, slug: &str) -> Result<(Puzzle, BTreeMap<PieceId, String>)> {
        let parts = self.store.get(|doc| {
            doc.puzzle(slug).map(|puzzle| {
                (
                    puzzle.clone(),
                    doc.piece_assets(slug).cloned().unwrap_or_default(),
                )
            })
        })?;
        Ok(parts)
    }
}

/// `<slug>-<user>.png`. Both ids arrive from the chat feed, so any id that could name a
/// path outside the render directory is refused.
pub fn progress_file_name(slug: &str, user_id: &str) -> Result<String> {
    check_file_id("puzzle", slug)?;
    check_file_id("user", user_id)?;
    Ok(format!("{slug}-{user_id}.png"))
}

pub fn puzzle_file_name(slug: &str) -> Result<String> {
    check_file_id("puzzle", slug)?;
    Ok(format!("{slug}.png"))
}

fn check_file_id(kind: &str, id: &str) -> Result<()> {
    let unsafe_char = |c: char| matches!(c, '/' | '\\' | '\0' | ':');
    if id.is_empty() || id.contains("..") || id.contains(unsafe_char) {
        bail!("{kind} id {id:?} cannot be used in a file name");
    }
    Ok(())
}
