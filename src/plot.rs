use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use eframe::egui;
use eframe::NativeOptions;
use egui::{Align2, Color32, RichText, ViewportCommand};
use egui_plot::{Line, MarkerShape, Plot, PlotPoint, PlotPoints, Points, Text};
use log::{debug, error, info, warn};

use crate::artists::{ElementId, PlotElement, RenderSurface};
use crate::error::{RefreshError, RenderError};
use crate::refresh::{CancellationToken, LoopSummary, RefreshLoop};
use crate::settings::DisplaySettings;
use crate::snapshot::{SnapshotRequest, SnapshotSource};

// Curves are drawn with a floor so silent bins (-inf dB) stay plottable
const CURVE_FLOOR_DB: f64 = -400.0;

const TRACE_COLOR: Color32 = Color32::from_rgb(44, 160, 44);

/// One complete set of elements as last published by the refresh loop.
#[derive(Clone, Default)]
pub struct PublishedFrame {
    pub elements: Vec<Arc<PlotElement>>,
    pub generation: u64,
    pub updated_at: Option<DateTime<Local>>,
}

pub type SharedFrame = Arc<Mutex<PublishedFrame>>;

/// Render surface backed by an egui window.
///
/// Elements are staged locally and only become visible to the UI thread on
/// [`RenderSurface::request_redraw`], which swaps in the whole staged set at
/// once.
pub struct SceneSurface {
    staged: Vec<(ElementId, Arc<PlotElement>)>,
    next_id: u64,
    frame: SharedFrame,
    ctx: egui::Context,
}

impl SceneSurface {
    pub fn new(frame: SharedFrame, ctx: egui::Context) -> Self {
        Self {
            staged: Vec::new(),
            next_id: 0,
            frame,
            ctx,
        }
    }

    pub fn close_window(&self) {
        self.ctx.send_viewport_cmd(ViewportCommand::Close);
    }
}

impl RenderSurface for SceneSurface {
    fn draw(&mut self, element: PlotElement) -> Result<ElementId, RenderError> {
        let id = ElementId(self.next_id);
        self.next_id += 1;
        self.staged.push((id, Arc::new(element)));
        Ok(id)
    }

    fn dispose(&mut self, id: ElementId) -> Result<(), RenderError> {
        let pos = self
            .staged
            .iter()
            .position(|(staged, _)| *staged == id)
            .ok_or(RenderError::UnknownElement(id))?;
        self.staged.remove(pos);
        Ok(())
    }

    fn request_redraw(&mut self) -> Result<(), RenderError> {
        {
            let mut frame = self.frame.lock().map_err(|_| RenderError::Poisoned)?;
            frame.elements = self.staged.iter().map(|(_, e)| Arc::clone(e)).collect();
            frame.generation += 1;
            frame.updated_at = Some(Local::now());
        }
        self.ctx.request_repaint();
        Ok(())
    }

    fn process_events(&mut self, timeout: Duration) -> Result<(), RenderError> {
        // The UI thread services its own events; the loop just steps aside.
        thread::sleep(timeout);
        Ok(())
    }
}

/// Static description of the window.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub window_title: String,
    pub plot_title: String,
    pub max_freq_khz: f64,
    pub display: DisplaySettings,
}

pub struct ThdApp {
    pub frame: SharedFrame,
    pub token: CancellationToken,
    pub view: ViewConfig,
}

impl ThdApp {
    pub fn new(frame: SharedFrame, token: CancellationToken, view: ViewConfig) -> Self {
        Self { frame, token, view }
    }

    fn draw_element(&self, plot_ui: &mut egui_plot::PlotUi, element: &PlotElement) {
        match element {
            PlotElement::SpectrumCurve { points } => {
                let points: PlotPoints = points
                    .iter()
                    .map(|&[x, y]| [x, if y.is_finite() { y } else { CURVE_FLOOR_DB }])
                    .collect();
                plot_ui.line(
                    Line::new(points)
                        .color(TRACE_COLOR.gamma_multiply(0.75))
                        .width(1.0),
                );
            }
            PlotElement::FundamentalMarker { at } => {
                plot_ui.points(
                    Points::new(vec![*at])
                        .shape(MarkerShape::Circle)
                        .filled(true)
                        .radius(4.0)
                        .color(TRACE_COLOR),
                );
            }
            PlotElement::HarmonicMarker { at } => {
                plot_ui.points(
                    Points::new(vec![*at])
                        .shape(MarkerShape::Cross)
                        .radius(5.0)
                        .color(TRACE_COLOR),
                );
            }
            PlotElement::Annotation { text } => {
                // Pinned to the axes, not the data: 40% across, 5% down.
                let bounds = plot_ui.plot_bounds();
                let pos = PlotPoint::new(
                    bounds.min()[0] + 0.4 * bounds.width(),
                    bounds.max()[1] - 0.05 * bounds.height(),
                );
                let rich = RichText::new(text)
                    .size(self.view.display.annotation_font_size)
                    .color(Color32::BLACK)
                    .background_color(Color32::from_rgba_unmultiplied(211, 211, 211, 191));
                plot_ui.text(Text::new(pos, rich).anchor(Align2::LEFT_TOP));
            }
        }
    }
}

impl eframe::App for ThdApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if ctx.input(|i| i.viewport().close_requested()) && self.token.cancel() {
            info!("Window close requested, stopping refresh loop");
        }

        // Clone the frame out so the refresh thread never waits on painting.
        let frame = match self.frame.lock() {
            Ok(frame) => frame.clone(),
            Err(_) => {
                error!("Published frame is poisoned, closing window");
                self.token.cancel();
                ctx.send_viewport_cmd(ViewportCommand::Close);
                return;
            }
        };

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            let status = match frame.updated_at {
                Some(at) => format!("frame {} at {}", frame.generation, at.format("%H:%M:%S%.3f")),
                None => "waiting for first measurement ...".to_string(),
            };
            ui.label(status);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| ui.heading(&self.view.plot_title));

            let display = &self.view.display;
            Plot::new("thd_spectrum")
                .x_axis_label("frequency (kHz)")
                .y_axis_label("dBVrms")
                .show_grid(true)
                .include_x(0.0)
                .include_x(self.view.max_freq_khz)
                .include_y(display.y_min_db)
                .include_y(display.y_max_db)
                .allow_drag(false)
                .allow_zoom(false)
                .allow_scroll(false)
                .allow_boxed_zoom(false)
                .show(ui, |plot_ui| {
                    // Anything outside the fixed range is clipped, like a fixed ylim.
                    plot_ui.set_plot_bounds(egui_plot::PlotBounds::from_min_max(
                        [0.0, display.y_min_db],
                        [self.view.max_freq_khz, display.y_max_db],
                    ));
                    for element in &frame.elements {
                        self.draw_element(plot_ui, element);
                    }
                });
        });
    }
}

/// Opens the window and drives `source` from a worker thread until the window
/// closes or a cycle fails.
///
/// The loop's outcome is sent on `outcome_tx` once it stops. A failing loop
/// closes the window itself so that `eframe::run_native` returns.
pub fn run_native<S>(
    source: S,
    request: SnapshotRequest,
    view: ViewConfig,
    token: CancellationToken,
    outcome_tx: Sender<Result<LoopSummary, RefreshError>>,
) -> Result<(), eframe::Error>
where
    S: SnapshotSource + Send + 'static,
{
    let native_options = NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(view.window_title.clone())
            .with_inner_size([view.display.width, view.display.height]),
        vsync: true,
        ..Default::default()
    };
    let app_name = view.window_title.clone();
    let event_wait = view.display.event_wait();

    eframe::run_native(
        &app_name,
        native_options,
        Box::new(move |cc| {
            let ctx = cc.egui_ctx.clone();
            let frame: SharedFrame = Arc::new(Mutex::new(PublishedFrame::default()));

            {
                let token = token.clone();
                let ctx = ctx.clone();
                if let Err(e) = ctrlc::set_handler(move || {
                    if token.cancel() {
                        info!("Ctrl-C received, stopping refresh loop");
                    }
                    ctx.send_viewport_cmd(ViewportCommand::Close);
                }) {
                    warn!("Could not install Ctrl-C handler: {}", e);
                }
            }

            info!("Starting refresh loop...");
            let surface = SceneSurface::new(Arc::clone(&frame), ctx);
            let loop_token = token.clone();
            thread::spawn(move || {
                let mut refresh = RefreshLoop::new(source, surface, request, event_wait);
                let outcome = refresh.run(&loop_token);
                if let Err(e) = &outcome {
                    error!(target: "refresh", "refresh loop failed: {}", e);
                    refresh.surface_mut().close_window();
                }
                if outcome_tx.send(outcome).is_err() {
                    debug!(target: "refresh", "nobody is waiting for the loop outcome");
                }
            });

            Box::new(ThdApp::new(frame, token, view))
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> (SceneSurface, SharedFrame) {
        let frame: SharedFrame = Arc::new(Mutex::new(PublishedFrame::default()));
        (SceneSurface::new(Arc::clone(&frame), egui::Context::default()), frame)
    }

    fn marker(x: f64) -> PlotElement {
        PlotElement::HarmonicMarker { at: [x, -40.0] }
    }

    #[test]
    fn staged_elements_are_invisible_until_redraw() {
        let (mut surface, frame) = surface();
        surface.draw(marker(1.0)).unwrap();
        surface.draw(marker(2.0)).unwrap();
        assert!(frame.lock().unwrap().elements.is_empty());

        surface.request_redraw().unwrap();
        let published = frame.lock().unwrap().clone();
        assert_eq!(published.elements.len(), 2);
        assert_eq!(published.generation, 1);
        assert!(published.updated_at.is_some());
    }

    #[test]
    fn dispose_removes_only_the_named_element() {
        let (mut surface, frame) = surface();
        let a = surface.draw(marker(1.0)).unwrap();
        let _b = surface.draw(marker(2.0)).unwrap();
        surface.dispose(a).unwrap();
        surface.request_redraw().unwrap();

        let published = frame.lock().unwrap().clone();
        assert_eq!(published.elements.len(), 1);
        assert_eq!(*published.elements[0], marker(2.0));
        assert!(matches!(surface.dispose(a), Err(RenderError::UnknownElement(id)) if id == a));
    }

    #[test]
    fn published_frame_only_holds_complete_cycles() {
        use crate::artists::tests::snapshot_with_bins;
        use crate::artists::ArtistManager;

        let (mut surface, frame) = surface();
        let mut artists = ArtistManager::new();
        for bins in [vec![4, 8, 12], vec![4]] {
            let snap = snapshot_with_bins(bins);
            let levels = snap.levels_db();
            let drawn = artists.refresh(&mut surface, &snap, &levels, "THD").unwrap();
            assert_eq!(frame.lock().unwrap().elements.len(), drawn);
        }
        assert_eq!(frame.lock().unwrap().generation, 2);
    }
}
