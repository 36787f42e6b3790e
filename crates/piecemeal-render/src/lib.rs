pub mod cache;
pub mod glyphs;

pub use cache::{cache_key, RenderCache};

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use piecemeal_core::{GridPosition, PieceId, Puzzle};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("asset not found: {0}")]
    MissingAsset(String),
    #[error("asset {reference} could not be read: {reason}")]
    Unreadable { reference: String, reason: String },
    #[error("asset {reference} could not be decoded: {reason}")]
    Decode { reference: String, reason: String },
    #[error("image encode failed: {0}")]
    Encode(String),
    #[error("invalid puzzle geometry: {0}")]
    Geometry(String),
}

pub trait AssetSource: Send + Sync {
    fn load(&self, reference: &str) -> Result<Vec<u8>, RenderError>;
}

/// Resolves relative asset references against a root directory.
pub struct FsAssetSource {
    root: PathBuf,
}

impl FsAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl AssetSource for FsAssetSource {
    fn load(&self, reference: &str) -> Result<Vec<u8>, RenderError> {
        let path = self.resolve(reference);
        std::fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                RenderError::MissingAsset(reference.to_string())
            } else {
                RenderError::Unreadable {
                    reference: reference.to_string(),
                    reason: err.to_string(),
                }
            }
        })
    }
}

#[derive(Default)]
pub struct MemoryAssetSource {
    assets: HashMap<String, Vec<u8>>,
}

impl MemoryAssetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: impl Into<String>, bytes: Vec<u8>) {
        self.assets.insert(reference.into(), bytes);
    }
}

impl AssetSource for MemoryAssetSource {
    fn load(&self, reference: &str) -> Result<Vec<u8>, RenderError> {
        self.assets
            .get(reference)
            .cloned()
            .ok_or_else(|| RenderError::MissingAsset(reference.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Cell size used when the base image cannot be loaded.
    pub fallback_tile_px: u32,
    pub background: Rgba<u8>,
    pub placeholder: Rgba<u8>,
    pub placeholder_border: Rgba<u8>,
    pub bar_background: Rgba<u8>,
    pub bar_fill: Rgba<u8>,
    pub label_color: Rgba<u8>,
    pub show_progress: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fallback_tile_px: 128,
            background: Rgba([48, 48, 56, 255]),
            placeholder: Rgba([92, 92, 104, 255]),
            placeholder_border: Rgba([64, 64, 72, 255]),
            bar_background: Rgba([0, 0, 0, 170]),
            bar_fill: Rgba([88, 190, 120, 230]),
            label_color: Rgba([255, 255, 255, 255]),
            show_progress: true,
        }
    }
}

pub struct RenderRequest<'a> {
    pub slug: &'a str,
    pub puzzle: &'a Puzzle,
    pub pieces: &'a BTreeMap<PieceId, String>,
    pub owned: &'a BTreeSet<PieceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlacement {
    pub piece_id: PieceId,
    pub position: GridPosition,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub placeholder: bool,
}

#[derive(Debug, Clone)]
pub struct RenderedProgress {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub owned: usize,
    pub total: u32,
    pub label: String,
    pub complete: bool,
    pub revealed: bool,
    pub placements: Vec<TilePlacement>,
}

pub struct ProgressRenderer {
    config: RenderConfig,
    assets: Arc<dyn AssetSource>,
}

impl ProgressRenderer {
    pub fn new(config: RenderConfig, assets: Arc<dyn AssetSource>) -> Self {
        Self { config, assets }
    }

    /// Composites the progress preview. Output depends only on the request and the assets,
    /// so identical inputs give identical bytes. A piece whose asset is missing or corrupt
    /// is drawn as a placeholder tile instead of failing the render.
    pub fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedProgress, RenderError> {
        let puzzle = request.puzzle;
        puzzle
            .validate(request.slug)
            .map_err(|err| RenderError::Geometry(err.to_string()))?;

        let owned: Vec<PieceId> = request
            .owned
            .iter()
            .copied()
            .filter(|piece_id| puzzle.contains_piece(*piece_id))
            .collect();
        let complete = puzzle.is_complete_with(owned.len());
        let label = format!("{}/{}", owned.len(), puzzle.piece_count);

        let revealed_canvas = if complete {
            match self.decode(&puzzle.full_image_ref) {
                Ok(canvas) => Some(canvas),
                Err(err) => {
                    warn!(
                        event = "render_placeholder",
                        puzzle = request.slug,
                        asset = %puzzle.full_image_ref,
                        error = %err
                    );
                    None
                }
            }
        } else {
            None
        };
        let revealed = revealed_canvas.is_some();

        let (mut canvas, placements) = match revealed_canvas {
            Some(canvas) => (canvas, Vec::new()),
            None => self.compose_tiles(request, &owned),
        };

        if self.config.show_progress {
            self.draw_progress(&mut canvas, owned.len(), puzzle.piece_count, &label);
        }

        let (width, height) = canvas.dimensions();
        let mut png = Vec::new();
        canvas
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|err| RenderError::Encode(err.to_string()))?;

        debug!(
            event = "progress_rendered",
            puzzle = request.slug,
            owned = owned.len(),
            total = puzzle.piece_count,
            bytes = png.len()
        );

        Ok(RenderedProgress {
            png,
            width,
            height,
            owned: owned.len(),
            total: puzzle.piece_count,
            label,
            complete,
            revealed,
            placements,
        })
    }

    fn compose_tiles(
        &self,
        request: &RenderRequest<'_>,
        owned: &[PieceId],
    ) -> (RgbaImage, Vec<TilePlacement>) {
        let puzzle = request.puzzle;
        let mut canvas = match self.decode(&puzzle.base_image_ref) {
            Ok(canvas) => canvas,
            Err(err) => {
                warn!(
                    event = "render_placeholder",
                    puzzle = request.slug,
                    asset = %puzzle.base_image_ref,
                    error = %err
                );
                RgbaImage::from_pixel(
                    self.config.fallback_tile_px * puzzle.cols,
                    self.config.fallback_tile_px * puzzle.rows,
                    self.config.background,
                )
            }
        };

        let (canvas_width, canvas_height) = canvas.dimensions();
        let tile_width = (canvas_width / puzzle.cols).max(1);
        let tile_height = (canvas_height / puzzle.rows).max(1);

        let mut placements = Vec::with_capacity(owned.len());
        for piece_id in owned {
            let Some(position) = puzzle.piece_position(*piece_id) else {
                continue;
            };
            let x = position.col * tile_width;
            let y = position.row * tile_height;

            let tile = request
                .pieces
                .get(piece_id)
                .ok_or_else(|| RenderError::MissingAsset(format!("{}#{piece_id}", request.slug)))
                .and_then(|reference| self.decode(reference));
            let placeholder = match tile {
                Ok(tile) => {
                    let tile = if tile.dimensions() == (tile_width, tile_height) {
                        tile
                    } else {
                        imageops::resize(&tile, tile_width, tile_height, FilterType::Triangle)
                    };
                    imageops::overlay(&mut canvas, &tile, i64::from(x), i64::from(y));
                    false
                }
                Err(err) => {
                    warn!(
                        event = "render_placeholder",
                        puzzle = request.slug,
                        piece_id = *piece_id,
                        error = %err
                    );
                    self.fill_placeholder(&mut canvas, x, y, tile_width, tile_height);
                    true
                }
            };

            placements.push(TilePlacement {
                piece_id: *piece_id,
                position,
                x,
                y,
                width: tile_width,
                height: tile_height,
                placeholder,
            });
        }

        (canvas, placements)
    }

    fn decode(&self, reference: &str) -> Result<RgbaImage, RenderError> {
        let bytes = self.assets.load(reference)?;
        image::load_from_memory(&bytes)
            .map(|image| image.to_rgba8())
            .map_err(|err| RenderError::Decode {
                reference: reference.to_string(),
                reason: err.to_string(),
            })
    }

    fn fill_placeholder(&self, canvas: &mut RgbaImage, x: u32, y: u32, width: u32, height: u32) {
        let (canvas_width, canvas_height) = canvas.dimensions();
        for py in y..(y + height).min(canvas_height) {
            for px in x..(x + width).min(canvas_width) {
                let border = px == x || py == y || px + 1 == x + width || py + 1 == y + height;
                let color = if border {
                    self.config.placeholder_border
                } else {
                    self.config.placeholder
                };
                canvas.put_pixel(px, py, color);
            }
        }
    }

    fn draw_progress(&self, canvas: &mut RgbaImage, owned: usize, total: u32, label: &str) {
        let (width, height) = canvas.dimensions();
        let bar_height = (height / 10).clamp(7, 48).min(height);
        let top = height - bar_height;

        let filled = if total == 0 {
            0
        } else {
            ((u64::from(width) * owned as u64) / u64::from(total)) as u32
        };
        for y in top..height {
            for x in 0..width {
                let color = if x < filled {
                    self.config.bar_fill
                } else {
                    self.config.bar_background
                };
                blend_pixel(canvas, x, y, color);
            }
        }

        let scale = ((bar_height.saturating_sub(2)) / glyphs::text_height(1)).max(1);
        let text_top = top + bar_height.saturating_sub(glyphs::text_height(scale)) / 2;
        let text_width = glyphs::text_width(label, scale);
        let text_left = width.saturating_sub(text_width) / 2;
        glyphs::draw_text(canvas, label, text_left, text_top, scale, self.config.label_color);
    }
}

fn blend_pixel(canvas: &mut RgbaImage, x: u32, y: u32, color: Rgba<u8>) {
    let alpha = u32::from(color[3]);
    let pixel = canvas.get_pixel_mut(x, y);
    for channel in 0..3 {
        let under = u32::from(pixel[channel]);
        let over = u32::from(color[channel]);
        pixel[channel] = ((over * alpha + under * (255 - alpha)) / 255) as u8;
    }
    pixel[3] = pixel[3].max(color[3]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    fn demo_2x2() -> Puzzle {
        Puzzle {
            display_name: "Demo".to_string(),
            piece_count: 4,
            rows: 2,
            cols: 2,
            base_image_ref: "demo/base.png".to_string(),
            full_image_ref: "demo/full.png".to_string(),
            reward_ref: None,
            enabled: true,
        }
    }

    fn piece_map() -> BTreeMap<PieceId, String> {
        (1..=4).map(|id| (id, format!("demo/{id}.png"))).collect()
    }

    fn assets() -> MemoryAssetSource {
        let mut assets = MemoryAssetSource::new();
        assets.insert("demo/base.png", solid_png(100, 100, [10, 10, 10, 255]));
        assets.insert("demo/full.png", solid_png(100, 100, [0, 0, 200, 255]));
        assets.insert("demo/1.png", solid_png(50, 50, [200, 0, 0, 255]));
        assets.insert("demo/2.png", solid_png(50, 50, [0, 200, 0, 255]));
        assets.insert("demo/3.png", solid_png(25, 25, [200, 200, 0, 255]));
        assets.insert("demo/4.png", b"not an image".to_vec());
        assets
    }

    fn renderer(assets: MemoryAssetSource) -> ProgressRenderer {
        ProgressRenderer::new(RenderConfig::default(), Arc::new(assets))
    }

    fn decode(render: &RenderedProgress) -> RgbaImage {
        image::load_from_memory(&render.png)
            .expect("decode output")
            .to_rgba8()
    }

    #[test]
    fn places_owned_pieces_on_their_grid_cells() {
        let puzzle = demo_2x2();
        let pieces = piece_map();
        let owned = BTreeSet::from([1, 3]);
        let render = renderer(assets())
            .render(&RenderRequest {
                slug: "demo",
                puzzle: &puzzle,
                pieces: &pieces,
                owned: &owned,
            })
            .expect("render");

        assert_eq!(render.label, "2/4");
        assert!(!render.complete);
        assert_eq!(render.placements.len(), 2);
        assert_eq!(render.placements[0].piece_id, 1);
        assert_eq!(render.placements[0].position, GridPosition { row: 0, col: 0 });
        assert_eq!((render.placements[0].x, render.placements[0].y), (0, 0));
        assert_eq!(render.placements[1].piece_id, 3);
        assert_eq!(render.placements[1].position, GridPosition { row: 1, col: 0 });
        assert_eq!((render.placements[1].x, render.placements[1].y), (0, 50));

        let image = decode(&render);
        assert_eq!(*image.get_pixel(10, 10), Rgba([200, 0, 0, 255]));
        assert_eq!(*image.get_pixel(70, 10), Rgba([10, 10, 10, 255]));
        // piece 3 was upscaled from 25px to fill its cell
        assert_eq!(*image.get_pixel(10, 60), Rgba([200, 200, 0, 255]));
    }

    #[test]
    fn identical_inputs_render_identical_bytes() {
        let puzzle = demo_2x2();
        let pieces = piece_map();
        let owned = BTreeSet::from([2]);
        let renderer = renderer(assets());
        let request = RenderRequest {
            slug: "demo",
            puzzle: &puzzle,
            pieces: &pieces,
            owned: &owned,
        };
        let first = renderer.render(&request).expect("first render");
        let second = renderer.render(&request).expect("second render");
        assert_eq!(first.png, second.png);
    }

    #[test]
    fn corrupt_piece_degrades_to_placeholder() {
        let puzzle = demo_2x2();
        let pieces = piece_map();
        let owned = BTreeSet::from([1, 4]);
        let render = renderer(assets())
            .render(&RenderRequest {
                slug: "demo",
                puzzle: &puzzle,
                pieces: &pieces,
                owned: &owned,
            })
            .expect("render");

        let placeholder = render
            .placements
            .iter()
            .find(|placement| placement.piece_id == 4)
            .expect("piece 4 placed");
        assert!(placeholder.placeholder);
        let image = decode(&render);
        assert_eq!(
            *image.get_pixel(75, 60),
            RenderConfig::default().placeholder
        );
    }

    #[test]
    fn complete_set_shows_revealed_image() {
        let puzzle = demo_2x2();
        let pieces = piece_map();
        let owned = BTreeSet::from([1, 2, 3, 4]);
        let render = renderer(assets())
            .render(&RenderRequest {
                slug: "demo",
                puzzle: &puzzle,
                pieces: &pieces,
                owned: &owned,
            })
            .expect("render");

        assert!(render.complete);
        assert!(render.revealed);
        assert!(render.placements.is_empty());
        assert_eq!(render.label, "4/4");
        assert_eq!(*decode(&render).get_pixel(50, 20), Rgba([0, 0, 200, 255]));
    }

    #[test]
    fn missing_base_falls_back_to_blank_canvas() {
        let puzzle = demo_2x2();
        let pieces = piece_map();
        let owned = BTreeSet::from([2]);
        let render = renderer(MemoryAssetSource::new())
            .render(&RenderRequest {
                slug: "demo",
                puzzle: &puzzle,
                pieces: &pieces,
                owned: &owned,
            })
            .expect("render");

        assert_eq!((render.width, render.height), (256, 256));
        assert!(render.placements[0].placeholder);
        assert_eq!(render.label, "1/4");
    }

    #[test]
    fn ignores_out_of_range_ids() {
        let puzzle = demo_2x2();
        let pieces = piece_map();
        let owned = BTreeSet::from([1, 9]);
        let render = renderer(assets())
            .render(&RenderRequest {
                slug: "demo",
                puzzle: &puzzle,
                pieces: &pieces,
                owned: &owned,
            })
            .expect("render");
        assert_eq!(render.owned, 1);
        assert_eq!(render.label, "1/4");
    }

    #[test]
    fn fs_source_resolves_relative_to_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("demo")).expect("mkdir");
        std::fs::write(dir.path().join("demo/base.png"), solid_png(4, 4, [1, 2, 3, 255]))
            .expect("write asset");
        let source = FsAssetSource::new(dir.path());
        assert!(source.load("demo/base.png").is_ok());
        assert!(matches!(
            source.load("demo/missing.png"),
            Err(RenderError::MissingAsset(_))
        ));
    }
}
