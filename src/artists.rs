use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::debug;

use crate::error::RenderError;
use crate::snapshot::HarmonicSnapshot;

/// Identifies one element drawn on a render surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something the refresh loop asks a surface to draw.
///
/// Coordinates are `[frequency in kHz, level in dBVrms]`.
#[derive(Debug, Clone, PartialEq)]
pub enum PlotElement {
    Annotation { text: String },
    HarmonicMarker { at: [f64; 2] },
    FundamentalMarker { at: [f64; 2] },
    SpectrumCurve { points: Vec<[f64; 2]> },
}

/// The drawing primitives the refresh loop needs from a window toolkit.
pub trait RenderSurface {
    fn draw(&mut self, element: PlotElement) -> Result<ElementId, RenderError>;

    /// Removes a previously drawn element and releases whatever backs it.
    fn dispose(&mut self, id: ElementId) -> Result<(), RenderError>;

    fn request_redraw(&mut self) -> Result<(), RenderError>;

    /// Lets the toolkit service its events for at most `timeout`.
    fn process_events(&mut self, timeout: Duration) -> Result<(), RenderError>;
}

/// Owns the elements currently on screen and retires them oldest-first.
///
/// New elements are always drawn before the previous cycle's are disposed,
/// so the surface never shows an empty plot between two refreshes.
#[derive(Debug, Default)]
pub struct ArtistManager {
    visible: VecDeque<ElementId>,
}

impl ArtistManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn visible(&self) -> impl Iterator<Item = &ElementId> {
        self.visible.iter()
    }

    #[allow(dead_code)]
    pub fn visible_count(&self) -> usize {
        self.visible.len()
    }

    /// Draws one snapshot and retires everything older.
    ///
    /// `levels_db` is the snapshot's spectrum in dBVrms, index-aligned with its
    /// frequency axis. Returns the number of elements drawn.
    pub fn refresh<R: RenderSurface + ?Sized>(
        &mut self,
        surface: &mut R,
        snapshot: &HarmonicSnapshot,
        levels_db: &[f64],
        annotation: &str,
    ) -> Result<usize, RenderError> {
        let freqs = snapshot.frequencies();
        let at = |bin: usize| [freqs[bin] / 1000.0, levels_db[bin]];
        let mut drawn = 0;

        let id = surface.draw(PlotElement::Annotation {
            text: annotation.to_string(),
        })?;
        self.visible.push_back(id);
        drawn += 1;

        for &bin in snapshot.overtone_bins() {
            let id = surface.draw(PlotElement::HarmonicMarker { at: at(bin) })?;
            self.visible.push_back(id);
            drawn += 1;
        }

        let id = surface.draw(PlotElement::FundamentalMarker {
            at: at(snapshot.fundamental_bin()),
        })?;
        self.visible.push_back(id);
        drawn += 1;

        let points = freqs
            .iter()
            .zip(levels_db)
            .map(|(&f, &db)| [f / 1000.0, db])
            .collect();
        let id = surface.draw(PlotElement::SpectrumCurve { points })?;
        self.visible.push_back(id);
        drawn += 1;

        while self.visible.len() > drawn {
            if let Some(stale) = self.visible.pop_front() {
                surface.dispose(stale)?;
            }
        }
        debug!(target: "artists", "drew {} elements, {} visible", drawn, self.visible.len());

        surface.request_redraw()?;
        Ok(drawn)
    }
}
