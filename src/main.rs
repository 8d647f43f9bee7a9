mod api;
mod config;
mod suggestions;
mod tiles;

use api::BackendClient;
use city_sync::{
    click_exclusive, hover_exclusive, Category, CongestionLevel, Coordinates, DriverConfig, Entity,
    EntityDetails, EntityId, EntityKind, FeedStatus, MapSurface, OverlayRegistry, RefreshDriver,
    SelectionStore, SharedFeedSlot, Subscription,
};
use clap::Parser;
use config::AppConfig;
use eframe::egui;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use suggestions::{Suggestion, SuggestionService, SuggestionSource};
use tiles::{BasemapTiles, WebMercator};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const TILE_PIXEL_SIZE: f32 = 256.0;
const MARKER_RADIUS: f32 = 6.0;
const MARKER_HIT_RADIUS: f32 = 10.0;
const MIN_ZOOM: f32 = 10.0;
const MAX_ZOOM: f32 = 16.0;

#[derive(Debug, Parser)]
#[command(name = "citypulse-desktop", about = "Boston energy/traffic/weather map dashboard")]
struct Args {
    /// Backend base URL (overrides the config file)
    #[arg(long)]
    backend_url: Option<String>,

    /// Refresh cadence in seconds (overrides the config file)
    #[arg(long)]
    refresh_secs: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), eframe::Error> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if args.verbose { "debug" } else { "info" },
    ))
    .init();

    let mut app_config = AppConfig::load().unwrap_or_else(|e| {
        warn!("failed to load config, using defaults: {e}");
        AppConfig::default()
    });
    if let Some(url) = args.backend_url {
        app_config.backend_url = url;
    }
    if let Some(secs) = args.refresh_secs {
        app_config.refresh_seconds = secs;
    }

    info!("starting CityPulse Desktop against {}", app_config.backend_url);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1400.0, 850.0])
            .with_title("CityPulse Desktop"),
        ..Default::default()
    };

    eframe::run_native(
        "CityPulse Desktop",
        options,
        Box::new(move |_cc| Ok(Box::new(CityPulseApp::new(app_config)))),
    )
}

/// Retained drawing state for one marker; recomputed on every snapshot
/// update, painted every frame.
#[derive(Debug, Clone)]
struct MarkerVisual {
    coords: Coordinates,
    color: egui::Color32,
    label: String,
}

/// egui-side implementation of the rendering seam. Markers are plain data
/// repainted each frame, so place/restyle just (re)derive the visual.
#[derive(Debug, Default)]
struct MarkerSurface;

impl MapSurface for MarkerSurface {
    type Handle = MarkerVisual;

    fn place(&mut self, entity: &Entity) -> MarkerVisual {
        style_marker(entity)
    }

    fn restyle(&mut self, handle: &mut MarkerVisual, entity: &Entity) {
        *handle = style_marker(entity);
    }

    fn remove(&mut self, _handle: MarkerVisual) {}
}

fn style_marker(entity: &Entity) -> MarkerVisual {
    // valid_coordinates() is guaranteed by the reconciler for placed
    // entities; fall back to 0,0 rather than panic if that ever changes.
    let coords = entity
        .valid_coordinates()
        .unwrap_or(Coordinates::new(0.0, 0.0));
    let (color, label) = match &entity.details {
        EntityDetails::Building {
            name,
            usage_history,
            ..
        } => (
            usage_color(usage_history.last().map(|r| r.usage_kwh)),
            name.clone(),
        ),
        EntityDetails::Intersection {
            name, congestion, ..
        } => (congestion_color(*congestion), name.clone()),
        EntityDetails::Station { name, .. } => (egui::Color32::from_rgb(80, 140, 235), name.clone()),
        EntityDetails::Pinpoint { label } => {
            (egui::Color32::from_rgb(200, 120, 220), label.clone())
        }
    };
    MarkerVisual {
        coords,
        color,
        label,
    }
}

fn congestion_color(level: CongestionLevel) -> egui::Color32 {
    match level {
        CongestionLevel::Low => egui::Color32::from_rgb(80, 190, 90),
        CongestionLevel::Moderate => egui::Color32::from_rgb(230, 200, 50),
        CongestionLevel::High => egui::Color32::from_rgb(240, 140, 40),
        CongestionLevel::Severe => egui::Color32::from_rgb(220, 50, 50),
    }
}

// Monthly kWh mapped to a continuous green -> amber -> red gradient, in the
// same spirit as an altitude gradient: interpolate between fixed stops.
fn usage_color(usage_kwh: Option<f64>) -> egui::Color32 {
    let Some(usage) = usage_kwh else {
        return egui::Color32::from_rgb(140, 140, 140);
    };
    let usage = usage.clamp(0.0, 60000.0) as f32;

    let stops: [(f32, (f32, f32, f32)); 4] = [
        (0.0, (80.0, 190.0, 90.0)),
        (20000.0, (190.0, 210.0, 60.0)),
        (40000.0, (240.0, 140.0, 40.0)),
        (60000.0, (220.0, 50.0, 50.0)),
    ];

    for i in 0..stops.len() - 1 {
        let (lo, c1) = stops[i];
        let (hi, c2) = stops[i + 1];
        if usage >= lo && usage <= hi {
            let t = (usage - lo) / (hi - lo);
            let r = c1.0 + (c2.0 - c1.0) * t;
            let g = c1.1 + (c2.1 - c1.1) * t;
            let b = c1.2 + (c2.2 - c1.2) * t;
            return egui::Color32::from_rgb(r as u8, g as u8, b as u8);
        }
    }
    egui::Color32::from_rgb(220, 50, 50)
}

fn priority_color(priority: &str) -> egui::Color32 {
    match priority {
        "high" => egui::Color32::from_rgb(220, 80, 80),
        "medium" => egui::Color32::from_rgb(230, 180, 60),
        _ => egui::Color32::from_rgb(140, 180, 140),
    }
}

/// Everything owned per data layer: the refresh driver, its landing slot,
/// and the overlay registry mirroring the latest applied snapshot.
struct DataLayer {
    driver: RefreshDriver,
    slot: SharedFeedSlot,
    registry: OverlayRegistry<MarkerSurface>,
    seen_generation: u64,
}

impl DataLayer {
    fn start(
        category: Category,
        client: &BackendClient,
        interval: Duration,
    ) -> Self {
        let client = client.clone();
        let driver = RefreshDriver::spawn(
            DriverConfig::new(category).with_interval(interval),
            move || {
                let client = client.clone();
                async move { client.fetch_snapshot(category).await }
            },
        );
        let slot = driver.slot();
        Self {
            driver,
            slot,
            registry: OverlayRegistry::new(),
            seen_generation: 0,
        }
    }

    /// Pull a newly arrived snapshot into the registry, if any.
    fn sync(&mut self, surface: &mut MarkerSurface) {
        let snapshot = {
            let slot = self
                .slot
                .lock()
                .expect("feed slot lock poisoned - unrecoverable state");
            if slot.generation() == self.seen_generation {
                return;
            }
            self.seen_generation = slot.generation();
            slot.snapshot().cloned()
        };
        if let Some(snapshot) = snapshot {
            let stats = self.registry.apply(&snapshot, surface);
            info!(
                "{}: {} created, {} updated, {} removed, {} skipped",
                snapshot.category, stats.created, stats.updated, stats.removed, stats.skipped
            );
        }
    }
}

struct CityPulseApp {
    config: AppConfig,
    // Owns the refresh loops; kept alive for the app's lifetime.
    runtime: tokio::runtime::Runtime,
    client: BackendClient,
    layers: HashMap<Category, DataLayer>,
    surface: MarkerSurface,
    selection: SelectionStore,
    _selection_sub: Subscription,
    suggestion_service: SuggestionService,
    suggestion_state: Arc<Mutex<Option<(Vec<Suggestion>, SuggestionSource)>>>,
    suggestions_requested: bool,
    basemap: BasemapTiles,
    map_center_lat: f64,
    map_center_lon: f64,
    map_zoom_level: f32,
    map_notice: Option<String>,
}

impl CityPulseApp {
    fn new(config: AppConfig) -> Self {
        let runtime = tokio::runtime::Runtime::new()
            .expect("failed to start tokio runtime - unrecoverable state");
        let client = BackendClient::new(config.backend_url.clone());
        let interval = Duration::from_secs(config.refresh_seconds.max(5));

        let mut layers = HashMap::new();
        {
            let _guard = runtime.enter();
            for category in Category::ALL {
                if layer_enabled(&config, category) {
                    layers.insert(category, DataLayer::start(category, &client, interval));
                }
            }
        }

        let selection = SelectionStore::new();
        let selection_sub = selection.subscribe(|active| {
            info!(
                "active category: {}",
                active.map_or_else(|| "none".to_string(), |c| c.to_string())
            );
        });

        let suggestion_service = SuggestionService::new(
            config.backend_url.clone(),
            Duration::from_secs(config.suggestion_ttl_seconds),
        );

        let (map_center_lat, map_center_lon) = config.map_center();
        let map_zoom_level = config.default_zoom.clamp(MIN_ZOOM, MAX_ZOOM);

        Self {
            config,
            runtime,
            client,
            layers,
            surface: MarkerSurface,
            selection,
            _selection_sub: selection_sub,
            suggestion_service,
            suggestion_state: Arc::new(Mutex::new(None)),
            suggestions_requested: false,
            basemap: BasemapTiles::new(),
            map_center_lat,
            map_center_lon,
            map_zoom_level,
            map_notice: None,
        }
    }

    /// Mount or unmount a data layer. Unmounting disposes every overlay and
    /// cancels the refresh timer; a fetch still in flight lands in a slot
    /// nobody reads and the driver drops it after shutdown.
    fn set_layer_enabled(&mut self, category: Category, enabled: bool) {
        if enabled && !self.layers.contains_key(&category) {
            let _guard = self.runtime.enter();
            let interval = Duration::from_secs(self.config.refresh_seconds.max(5));
            self.layers.insert(
                category,
                DataLayer::start(category, &self.client, interval),
            );
        } else if !enabled {
            if let Some(mut layer) = self.layers.remove(&category) {
                layer.driver.shutdown();
                layer.registry.clear(&mut self.surface);
            }
            if self.selection.active() == Some(category) {
                self.selection.clear();
            }
        }

        match category {
            Category::Energy => self.config.show_energy = enabled,
            Category::Traffic => self.config.show_traffic = enabled,
            Category::Weather => self.config.show_weather = enabled,
        }
        if let Err(e) = self.config.save() {
            warn!("failed to save config: {e}");
        }
    }

    /// Kick off an async suggestion fetch, scoped to the pinned building
    /// marker when there is one.
    fn request_suggestions(&mut self) {
        let service = self.suggestion_service.clone();
        let state = self.suggestion_state.clone();
        let building_id = self.pinned_building_id();
        self.suggestions_requested = true;
        self.runtime.spawn(async move {
            let result = service.fetch(building_id).await;
            *state
                .lock()
                .expect("suggestion state lock poisoned - unrecoverable state") = Some(result);
        });
    }

    fn pinned_building_id(&self) -> Option<i64> {
        self.layers
            .values()
            .find_map(|layer| layer.registry.pinned())
            .filter(|id| id.kind == EntityKind::Building)
            .map(|id| id.id)
    }

    fn draw_category_strip(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let active = self.selection.active();
            for category in Category::ALL {
                let enabled = self.layers.contains_key(&category);
                let is_active = active == Some(category);

                let text = egui::RichText::new(category.label())
                    .size(13.0)
                    .strong()
                    .color(if is_active {
                        egui::Color32::BLACK
                    } else {
                        egui::Color32::from_rgb(210, 210, 210)
                    });
                let button = egui::Button::new(text).fill(if is_active {
                    egui::Color32::from_rgb(120, 200, 160)
                } else {
                    egui::Color32::from_rgb(50, 55, 60)
                });

                if ui.add(button).clicked() {
                    // Toggle semantics live in the store; re-click clears.
                    self.selection.select(category);
                }

                let mut show = enabled;
                if ui.checkbox(&mut show, "").changed() {
                    self.set_layer_enabled(category, show);
                }
                ui.add_space(8.0);
            }
        });
    }

    fn draw_status_strip(&mut self, ui: &mut egui::Ui) {
        for category in Category::ALL {
            let Some(layer) = self.layers.get(&category) else {
                continue;
            };
            let (status, fetching) = {
                let slot = layer
                    .slot
                    .lock()
                    .expect("feed slot lock poisoned - unrecoverable state");
                (slot.status().clone(), slot.is_fetching())
            };

            ui.horizontal(|ui| {
                ui.label(
                    egui::RichText::new(category.label())
                        .size(10.0)
                        .monospace()
                        .color(egui::Color32::from_rgb(150, 150, 150)),
                );
                match status {
                    FeedStatus::Idle => {
                        ui.label(egui::RichText::new("waiting for data").size(10.0));
                    }
                    FeedStatus::Ok { at } => {
                        ui.label(
                            egui::RichText::new(format!("ok {}", at.format("%H:%M:%S")))
                                .size(10.0)
                                .color(egui::Color32::from_rgb(100, 200, 100)),
                        );
                    }
                    FeedStatus::Error { message, .. } => {
                        ui.label(
                            egui::RichText::new("stale")
                                .size(10.0)
                                .color(egui::Color32::from_rgb(230, 160, 60)),
                        )
                        .on_hover_text(message);
                        if ui.small_button("Retry").clicked() {
                            layer.driver.refresh_now();
                        }
                    }
                }
                if fetching {
                    ui.spinner();
                }
            });
        }
    }

    fn draw_entity_list(&mut self, ui: &mut egui::Ui) {
        let active = self.selection.active();
        let mut focus_request: Option<(EntityId, Coordinates)> = None;

        egui::ScrollArea::vertical().show(ui, |ui| {
            for category in Category::ALL {
                let Some(layer) = self.layers.get(&category) else {
                    continue;
                };
                if active.is_some() && active != Some(category) {
                    continue;
                }

                ui.label(
                    egui::RichText::new(format!(
                        "{} ({})",
                        category.label().to_uppercase(),
                        layer.registry.len()
                    ))
                    .size(11.0)
                    .strong()
                    .color(egui::Color32::from_rgb(120, 200, 160)),
                );

                let mut overlays: Vec<_> = layer.registry.iter().collect();
                overlays.sort_unstable_by(|a, b| {
                    a.entity.details.name().cmp(b.entity.details.name())
                });

                for overlay in overlays {
                    let selected = layer.registry.pinned() == Some(overlay.entity.id);
                    let label = ui.selectable_label(
                        selected,
                        egui::RichText::new(&overlay.handle.label).size(11.0),
                    );
                    if label.clicked() {
                        focus_request = Some((overlay.entity.id, overlay.handle.coords));
                    }
                }
                ui.add_space(6.0);
            }
        });

        if let Some((id, coords)) = focus_request {
            click_exclusive(self.layers.values_mut().map(|l| &mut l.registry), id);
            self.map_center_lat = coords.lat;
            self.map_center_lon = coords.lon;
        }
    }

    fn draw_suggestions(&mut self, ui: &mut egui::Ui) {
        if !self.suggestions_requested {
            self.request_suggestions();
        }
        ui.horizontal(|ui| {
            ui.label(
                egui::RichText::new("AI SUGGESTIONS")
                    .size(12.0)
                    .strong()
                    .color(egui::Color32::from_rgb(120, 200, 160)),
            );
            if ui.small_button("Regenerate").clicked() {
                self.suggestion_service.invalidate();
                self.request_suggestions();
            }
        });

        let state = self
            .suggestion_state
            .lock()
            .expect("suggestion state lock poisoned - unrecoverable state")
            .clone();

        let Some((suggestions, source)) = state else {
            ui.spinner();
            return;
        };

        if source == SuggestionSource::Fallback {
            ui.label(
                egui::RichText::new("suggestion service unreachable - showing built-in playbook")
                    .size(9.5)
                    .color(egui::Color32::from_rgb(230, 160, 60)),
            );
        }

        egui::ScrollArea::vertical()
            .id_salt("suggestions")
            .show(ui, |ui| {
                for suggestion in &suggestions {
                    egui::Frame::group(ui.style()).show(ui, |ui| {
                        ui.horizontal(|ui| {
                            ui.label(
                                egui::RichText::new(suggestion.priority.to_uppercase())
                                    .size(9.0)
                                    .monospace()
                                    .color(priority_color(&suggestion.priority)),
                            );
                            ui.label(
                                egui::RichText::new(&suggestion.title).size(11.0).strong(),
                            );
                        });
                        ui.label(
                            egui::RichText::new(&suggestion.rationale)
                                .size(10.0)
                                .color(egui::Color32::from_rgb(180, 180, 180)),
                        );
                        ui.horizontal(|ui| {
                            if let Some(savings) = suggestion.estimated_savings {
                                ui.label(
                                    egui::RichText::new(format!("~${savings:.0}/yr"))
                                        .size(9.0)
                                        .color(egui::Color32::from_rgb(100, 200, 100)),
                                );
                            }
                            if let Some(ref timeline) = suggestion.timeline {
                                ui.label(
                                    egui::RichText::new(timeline).size(9.0).color(
                                        egui::Color32::from_rgb(140, 140, 140),
                                    ),
                                );
                            }
                        });
                    });
                    ui.add_space(3.0);
                }
            });
    }

    /// Bar chart of the active category's magnitude field, one bar per
    /// rendered entity.
    fn draw_analysis(&self, ui: &mut egui::Ui) {
        let Some(category) = self.selection.active() else {
            ui.label(
                egui::RichText::new("Select a category to see its distribution")
                    .size(10.0)
                    .color(egui::Color32::from_rgb(140, 140, 140)),
            );
            return;
        };
        let Some(layer) = self.layers.get(&category) else {
            return;
        };

        let mut bars = Vec::new();
        let mut overlays: Vec<_> = layer.registry.iter().collect();
        overlays.sort_unstable_by(|a, b| a.entity.details.name().cmp(b.entity.details.name()));
        for (i, overlay) in overlays.iter().enumerate() {
            let value = match &overlay.entity.details {
                EntityDetails::Building { usage_history, .. } => {
                    usage_history.last().map_or(0.0, |r| r.usage_kwh)
                }
                EntityDetails::Intersection {
                    total_vehicle_count,
                    ..
                } => f64::from(*total_vehicle_count),
                EntityDetails::Station { temp_avg_f, .. } => temp_avg_f.unwrap_or(0.0),
                EntityDetails::Pinpoint { .. } => 0.0,
            };
            bars.push(
                egui_plot::Bar::new(i as f64, value).name(overlay.entity.details.name()),
            );
        }

        let unit = match category {
            Category::Energy => "kWh",
            Category::Traffic => "vehicles",
            Category::Weather => "°F",
        };
        egui_plot::Plot::new("category_distribution")
            .height(140.0)
            .show_axes([false, true])
            .y_axis_label(unit)
            .show(ui, |plot_ui| {
                plot_ui.bar_chart(egui_plot::BarChart::new("distribution", bars));
            });
    }

    #[allow(clippy::too_many_lines, reason = "single cohesive painter pass")]
    fn draw_map(&mut self, ui: &mut egui::Ui) {
        let (response, painter) = ui.allocate_painter(
            egui::vec2(ui.available_width(), ui.available_height()),
            egui::Sense::click_and_drag(),
        );

        let rect = response.rect;
        let center = rect.center();
        painter.rect_filled(rect, 0.0, egui::Color32::from_rgb(225, 232, 238));

        // Pinch zoom
        let zoom_delta = ui.ctx().input(|i| i.zoom_delta());
        if (zoom_delta - 1.0).abs() > 0.001 {
            self.map_zoom_level =
                (self.map_zoom_level + zoom_delta.log2()).clamp(MIN_ZOOM, MAX_ZOOM);
        }
        let tile_zoom = self.map_zoom_level.round() as u8;

        // Basemap
        let visible = BasemapTiles::visible_tiles(
            self.map_center_lat,
            self.map_center_lon,
            tile_zoom,
            rect.width(),
            rect.height(),
        );
        let mut rendered = 0;
        for (coord, offset_x, offset_y) in visible {
            if let Some(texture) = self.basemap.texture_for(coord, ui.ctx()) {
                let tile_rect = egui::Rect::from_min_size(
                    egui::pos2(center.x + offset_x, center.y + offset_y),
                    egui::vec2(TILE_PIXEL_SIZE, TILE_PIXEL_SIZE),
                );
                painter.image(
                    texture.id(),
                    tile_rect,
                    egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0)),
                    egui::Color32::WHITE,
                );
                rendered += 1;
            }
        }
        self.map_notice = if self.basemap.failed_count() > 0 {
            Some(format!("{} tiles failed to load", self.basemap.failed_count()))
        } else if self.basemap.loading_count() > 0 {
            Some("Loading map tiles...".to_string())
        } else if rendered > 0 {
            None
        } else {
            self.map_notice.take()
        };

        // Drag to pan, Mercator-corrected
        if response.dragged() {
            let delta = response.drag_delta();
            let scale = 2.0_f64.powf(f64::from(self.map_zoom_level));
            let lat_per_pixel = 180.0 / (f64::from(TILE_PIXEL_SIZE) * scale);
            let lon_per_pixel = 360.0 / (f64::from(TILE_PIXEL_SIZE) * scale);
            let cos_lat = self.map_center_lat.to_radians().cos();

            self.map_center_lat += f64::from(delta.y) * lat_per_pixel;
            self.map_center_lon -= f64::from(delta.x) * lon_per_pixel / cos_lat.max(0.1);
            self.map_center_lat = self.map_center_lat.clamp(-85.0, 85.0);
        }

        let center_tile_x = WebMercator::lon_to_x(self.map_center_lon, tile_zoom);
        let center_tile_y = WebMercator::lat_to_y(self.map_center_lat, tile_zoom);
        let to_screen = |coords: Coordinates| -> egui::Pos2 {
            let tile_x = WebMercator::lon_to_x(coords.lon, tile_zoom);
            let tile_y = WebMercator::lat_to_y(coords.lat, tile_zoom);
            egui::pos2(
                center.x + ((tile_x - center_tile_x) * f64::from(TILE_PIXEL_SIZE)) as f32,
                center.y + ((tile_y - center_tile_y) * f64::from(TILE_PIXEL_SIZE)) as f32,
            )
        };

        let pointer = response.hover_pos();
        let clicked = response.clicked();
        let active = self.selection.active();

        // Hit-test across every visible layer first, picking one global
        // winner, so hover and click state is updated off this frame's
        // marker positions. Hover and pinned popups are exclusive across
        // categories.
        let mut under_pointer: Option<EntityId> = None;
        if let Some(pointer) = pointer {
            let mut best = MARKER_HIT_RADIUS;
            for (category, layer) in &self.layers {
                if active.is_some() && active != Some(*category) {
                    continue;
                }
                for overlay in layer.registry.iter() {
                    let pos = to_screen(overlay.handle.coords);
                    let dist = pos.distance(pointer);
                    if dist <= best {
                        best = dist;
                        under_pointer = Some(overlay.entity.id);
                    }
                }
            }
        }
        hover_exclusive(
            self.layers.values_mut().map(|l| &mut l.registry),
            under_pointer,
        );
        if clicked {
            if let Some(id) = under_pointer {
                click_exclusive(self.layers.values_mut().map(|l| &mut l.registry), id);
            }
        }

        for category in Category::ALL {
            let Some(layer) = self.layers.get(&category) else {
                continue;
            };
            let dimmed = active.is_some() && active != Some(category);

            for overlay in layer.registry.iter() {
                let pos = to_screen(overlay.handle.coords);
                if !rect.contains(pos) {
                    continue;
                }
                let color = if dimmed {
                    overlay.handle.color.gamma_multiply(0.25)
                } else {
                    overlay.handle.color
                };
                painter.circle_filled(pos, MARKER_RADIUS, color);
                if layer.registry.pinned() == Some(overlay.entity.id) {
                    painter.circle_stroke(
                        pos,
                        MARKER_RADIUS + 3.0,
                        egui::Stroke::new(2.0, egui::Color32::WHITE),
                    );
                }
            }
        }

        // Popups on top of all markers
        for category in Category::ALL {
            let Some(layer) = self.layers.get(&category) else {
                continue;
            };
            if let Some(id) = layer.registry.hovered() {
                if layer.registry.pinned() != Some(id) {
                    if let Some(overlay) = layer.registry.get(id) {
                        draw_hover_popup(&painter, to_screen(overlay.handle.coords), &overlay.entity);
                    }
                }
            }
            if let Some(id) = layer.registry.pinned() {
                if let Some(overlay) = layer.registry.get(id) {
                    let entity = overlay.entity.clone();
                    let pos = to_screen(overlay.handle.coords);
                    draw_pinned_popup(ui.ctx(), pos, &entity);
                }
            }
        }

        painter.text(
            rect.left_top() + egui::vec2(10.0, 10.0),
            egui::Align2::LEFT_TOP,
            "Drag to pan | Pinch to zoom | Click a marker to pin details",
            egui::FontId::proportional(12.0),
            egui::Color32::from_rgb(60, 60, 60),
        );
        painter.text(
            rect.right_bottom() + egui::vec2(-10.0, -10.0),
            egui::Align2::RIGHT_BOTTOM,
            "© OpenStreetMap contributors © CARTO",
            egui::FontId::proportional(10.0),
            egui::Color32::from_black_alpha(180),
        );

        if let Some(ref notice) = self.map_notice {
            let is_error = notice.contains("failed");
            let bg_color = if is_error {
                egui::Color32::from_rgb(220, 50, 50)
            } else {
                egui::Color32::from_rgb(255, 200, 100)
            };
            let notice_pos = rect.center_top() + egui::vec2(0.0, 20.0);
            let galley = painter.layout_no_wrap(
                notice.clone(),
                egui::FontId::proportional(12.0),
                egui::Color32::WHITE,
            );
            let bubble = egui::Rect::from_center_size(
                notice_pos,
                galley.size() + egui::vec2(24.0, 12.0),
            );
            painter.rect_filled(bubble, 5.0, bg_color);
            painter.text(
                notice_pos,
                egui::Align2::CENTER_CENTER,
                notice,
                egui::FontId::proportional(12.0),
                egui::Color32::WHITE,
            );
        }
    }
}

fn detail_lines(entity: &Entity) -> Vec<String> {
    match &entity.details {
        EntityDetails::Building {
            address,
            square_feet,
            building_category,
            year_built,
            ..
        } => {
            let mut lines = vec![
                address.clone(),
                format!("{building_category} | {square_feet} sq ft | built {year_built}"),
            ];
            if let Some(reading) = entity.details.latest_usage() {
                lines.push(format!(
                    "latest: {:.0} kWh (${:.0})",
                    reading.usage_kwh, reading.cost
                ));
            }
            lines
        }
        EntityDetails::Intersection {
            streets,
            total_vehicle_count,
            average_speed,
            congestion,
            ..
        } => vec![
            streets.join(" / "),
            format!("{total_vehicle_count} vehicles | {average_speed:.0} mph"),
            format!("congestion: {}", congestion.label()),
        ],
        EntityDetails::Station {
            temp_avg_f,
            precipitation_in,
            wind_speed_mph,
            humidity,
            ..
        } => {
            let mut lines = Vec::new();
            if let Some(t) = temp_avg_f {
                lines.push(format!("{t:.0}°F avg"));
            }
            if let Some(p) = precipitation_in {
                lines.push(format!("{p:.2} in precipitation"));
            }
            if let Some(w) = wind_speed_mph {
                lines.push(format!("{w:.0} mph wind"));
            }
            if let Some(h) = humidity {
                lines.push(format!("{h:.0}% humidity"));
            }
            if lines.is_empty() {
                lines.push("no readings yet".to_string());
            }
            lines
        }
        EntityDetails::Pinpoint { .. } => vec!["map point".to_string()],
    }
}

/// Lightweight hover popup painted directly, so it follows the pointer
/// without stealing focus.
fn draw_hover_popup(painter: &egui::Painter, pos: egui::Pos2, entity: &Entity) {
    let title = entity.details.name().to_string();
    let galley = painter.layout_no_wrap(
        title.clone(),
        egui::FontId::proportional(11.0),
        egui::Color32::WHITE,
    );
    let padding = egui::vec2(5.0, 3.0);
    let box_rect = egui::Rect::from_min_size(
        pos + egui::vec2(12.0, -galley.size().y / 2.0) - padding,
        galley.size() + padding * 2.0,
    );
    painter.rect_filled(box_rect, 3.0, egui::Color32::from_rgba_unmultiplied(0, 0, 0, 200));
    painter.text(
        pos + egui::vec2(12.0, 0.0),
        egui::Align2::LEFT_CENTER,
        title,
        egui::FontId::proportional(11.0),
        egui::Color32::WHITE,
    );
}

/// Pinned popup: a small floating window anchored near the marker. Buildings
/// additionally get a line chart of their monthly usage history.
fn draw_pinned_popup(ctx: &egui::Context, pos: egui::Pos2, entity: &Entity) {
    egui::Area::new(egui::Id::new(("pinned_popup", entity.id)))
        .fixed_pos(pos + egui::vec2(14.0, -10.0))
        .show(ctx, |ui| {
            egui::Frame::popup(ui.style()).show(ui, |ui| {
                ui.label(
                    egui::RichText::new(entity.details.name())
                        .size(12.0)
                        .strong(),
                );
                for line in detail_lines(entity) {
                    ui.label(
                        egui::RichText::new(line)
                            .size(10.0)
                            .color(egui::Color32::from_rgb(190, 190, 190)),
                    );
                }
                if let EntityDetails::Building { usage_history, .. } = &entity.details {
                    // One point is just the "latest" line again; plot from two.
                    if usage_history.len() >= 2 {
                        let points: Vec<[f64; 2]> = usage_history
                            .iter()
                            .enumerate()
                            .map(|(i, r)| [i as f64, r.usage_kwh])
                            .collect();
                        egui_plot::Plot::new(("usage_history", entity.id))
                            .height(90.0)
                            .width(230.0)
                            .show_axes([false, true])
                            .y_axis_label("kWh")
                            .show(ui, |plot_ui| {
                                plot_ui.line(egui_plot::Line::new(
                                    "monthly usage",
                                    egui_plot::PlotPoints::new(points),
                                ));
                            });
                    }
                }
            });
        });
}

fn layer_enabled(config: &AppConfig, category: Category) -> bool {
    match category {
        Category::Energy => config.show_energy,
        Category::Traffic => config.show_traffic,
        Category::Weather => config.show_weather,
    }
}

impl eframe::App for CityPulseApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Periodic repaint so freshly fetched snapshots appear without input.
        ctx.request_repaint_after(Duration::from_millis(500));

        for layer in self.layers.values_mut() {
            layer.sync(&mut self.surface);
        }

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.add_space(4.0);
            self.draw_category_strip(ui);
            ui.add_space(4.0);
        });

        egui::SidePanel::right("side_panel")
            .default_width(340.0)
            .show(ctx, |ui| {
                ui.add_space(6.0);
                self.draw_status_strip(ui);
                ui.separator();
                self.draw_analysis(ui);
                ui.separator();
                if self.config.suggestions_enabled {
                    self.draw_suggestions(ui);
                    ui.separator();
                }
                let expanded = self.config.entity_list_expanded;
                egui::CollapsingHeader::new("Entities")
                    .default_open(expanded)
                    .show(ui, |ui| {
                        self.draw_entity_list(ui);
                    });
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| {
                self.draw_map(ui);
            });
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        info!("shutting down - stopping refresh drivers");
        for (_, mut layer) in self.layers.drain() {
            layer.driver.shutdown();
            layer.registry.clear(&mut self.surface);
        }
        if let Err(e) = self.config.save() {
            warn!("failed to save config on exit: {e}");
        }
    }
}
