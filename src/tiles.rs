use egui::{ColorImage, TextureHandle};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

const TILE_SIZE: u32 = 256;
const CACHE_DURATION_DAYS: u64 = 14;

/// Web Mercator projection utilities
pub struct WebMercator;

impl WebMercator {
    /// Convert latitude to Web Mercator Y tile coordinate
    pub fn lat_to_y(lat: f64, zoom: u8) -> f64 {
        let lat_rad = lat.to_radians();
        let n = 2_f64.powi(i32::from(zoom));
        let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0;
        y * n
    }

    /// Convert longitude to Web Mercator X tile coordinate
    pub fn lon_to_x(lon: f64, zoom: u8) -> f64 {
        let n = 2_f64.powi(i32::from(zoom));
        ((lon + 180.0) / 360.0) * n
    }
}

/// Basemap tile address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub zoom: u8,
}

impl TileCoord {
    pub fn new(x: u32, y: u32, zoom: u8) -> Self {
        Self { x, y, zoom }
    }

    /// Carto light basemap URL (readable under colored data markers).
    pub fn url(&self) -> String {
        let subdomain = ['a', 'b', 'c', 'd'][((self.x + self.y) % 4) as usize];
        format!(
            "https://{}.basemaps.cartocdn.com/light_all/{}/{}/{}.png",
            subdomain, self.zoom, self.x, self.y
        )
    }

    fn cache_filename(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url().as_bytes());
        format!("{:x}.png", hasher.finalize())
    }
}

enum TileState {
    Loading,
    Loaded(TextureHandle),
    Failed,
}

/// Downloads, disk-caches, and hands out basemap tile textures.
pub struct BasemapTiles {
    cache_dir: PathBuf,
    tiles: Arc<Mutex<HashMap<TileCoord, TileState>>>,
}

impl Default for BasemapTiles {
    fn default() -> Self {
        Self::new()
    }
}

impl BasemapTiles {
    pub fn new() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("citypulse-desktop")
            .join("tiles");

        if let Err(e) = fs::create_dir_all(&cache_dir) {
            warn!("failed to create tile cache directory: {e}");
        }
        Self::evict_stale(&cache_dir);

        Self {
            cache_dir,
            tiles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn evict_stale(cache_dir: &Path) {
        let now = SystemTime::now();
        let max_age = Duration::from_secs(CACHE_DURATION_DAYS * 24 * 60 * 60);

        let Ok(entries) = fs::read_dir(cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age > max_age) {
                let _ = fs::remove_file(entry.path());
                debug!("evicted stale tile {:?}", entry.path());
            }
        }
    }

    /// Texture for a tile, if already available. Misses queue a background
    /// download and return None until it lands.
    pub fn texture_for(&self, coord: TileCoord, ctx: &egui::Context) -> Option<TextureHandle> {
        let mut tiles = self
            .tiles
            .lock()
            .expect("tile state lock poisoned - unrecoverable state");

        match tiles.get(&coord) {
            Some(TileState::Loaded(texture)) => Some(texture.clone()),
            Some(TileState::Loading | TileState::Failed) => None,
            None => {
                let cache_path = self.cache_dir.join(coord.cache_filename());
                if cache_path.exists() {
                    match load_texture(&fs::read(&cache_path).unwrap_or_default(), coord, ctx) {
                        Ok(texture) => {
                            tiles.insert(coord, TileState::Loaded(texture.clone()));
                            return Some(texture);
                        }
                        Err(e) => {
                            warn!("cached tile unreadable, re-downloading: {e}");
                            let _ = fs::remove_file(&cache_path);
                        }
                    }
                }
                tiles.insert(coord, TileState::Loading);
                self.spawn_download(coord, ctx.clone());
                None
            }
        }
    }

    fn spawn_download(&self, coord: TileCoord, ctx: egui::Context) {
        let tiles = self.tiles.clone();
        let cache_path = self.cache_dir.join(coord.cache_filename());

        std::thread::spawn(move || {
            let state = match download_tile(coord, &cache_path, &ctx) {
                Ok(texture) => {
                    ctx.request_repaint();
                    TileState::Loaded(texture)
                }
                Err(e) => {
                    warn!("tile {}/{}/{} failed: {e}", coord.zoom, coord.x, coord.y);
                    TileState::Failed
                }
            };
            tiles
                .lock()
                .expect("tile state lock poisoned - unrecoverable state")
                .insert(coord, state);
        });
    }

    /// Tiles covering a viewport, with pixel offsets from the map center.
    pub fn visible_tiles(
        center_lat: f64,
        center_lon: f64,
        zoom: u8,
        viewport_width: f32,
        viewport_height: f32,
    ) -> Vec<(TileCoord, f32, f32)> {
        let mut tiles = Vec::new();

        let center_tile_x = WebMercator::lon_to_x(center_lon, zoom);
        let center_tile_y = WebMercator::lat_to_y(center_lat, zoom);

        let tiles_wide = (viewport_width / TILE_SIZE as f32).ceil() as i32 + 2;
        let tiles_high = (viewport_height / TILE_SIZE as f32).ceil() as i32 + 2;

        let start_x = center_tile_x.floor() as i32 - tiles_wide / 2;
        let start_y = center_tile_y.floor() as i32 - tiles_high / 2;
        let max_tile = 2_i32.pow(u32::from(zoom));

        for dy in 0..tiles_high {
            for dx in 0..tiles_wide {
                let tile_x = start_x + dx;
                let tile_y = start_y + dy;

                // Longitude wraps, latitude clamps.
                let wrapped_x = ((tile_x % max_tile) + max_tile) % max_tile;
                if tile_y < 0 || tile_y >= max_tile {
                    continue;
                }

                let coord = TileCoord::new(wrapped_x as u32, tile_y as u32, zoom);
                let offset_x = (f64::from(tile_x) - center_tile_x) * f64::from(TILE_SIZE);
                let offset_y = (f64::from(tile_y) - center_tile_y) * f64::from(TILE_SIZE);
                tiles.push((coord, offset_x as f32, offset_y as f32));
            }
        }

        tiles
    }

    pub fn loading_count(&self) -> usize {
        let tiles = self
            .tiles
            .lock()
            .expect("tile state lock poisoned - unrecoverable state");
        tiles
            .values()
            .filter(|state| matches!(state, TileState::Loading))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        let tiles = self
            .tiles
            .lock()
            .expect("tile state lock poisoned - unrecoverable state");
        tiles
            .values()
            .filter(|state| matches!(state, TileState::Failed))
            .count()
    }
}

fn download_tile(
    coord: TileCoord,
    cache_path: &Path,
    ctx: &egui::Context,
) -> Result<TextureHandle, String> {
    let response = reqwest::blocking::get(coord.url()).map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    let bytes = response.bytes().map_err(|e| e.to_string())?;

    if let Err(e) = fs::write(cache_path, &bytes) {
        warn!("failed to cache tile: {e}");
    }

    load_texture(&bytes, coord, ctx)
}

fn load_texture(bytes: &[u8], coord: TileCoord, ctx: &egui::Context) -> Result<TextureHandle, String> {
    let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let rgba = img.to_rgba8();
    let color_image =
        ColorImage::from_rgba_unmultiplied([TILE_SIZE as usize, TILE_SIZE as usize], &rgba.into_raw());

    Ok(ctx.load_texture(
        format!("tile_{}_{}_{}", coord.zoom, coord.x, coord.y),
        color_image,
        Default::default(),
    ))
}
