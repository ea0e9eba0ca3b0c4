//! Grid-size agreement between panes that render the same multiplexer session.
//!
//! The first pane to attach to a multiplexer session sets the reference grid
//! from its own font metrics and pixel size. Later panes on the same session
//! adopt that grid and pick a font size that reproduces it in their own area.
//! The reference lives until the last pane releases it.

use crate::protocol::GridSize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Tolerance for float noise when flooring cell counts.
const EPSILON: f64 = 1e-4;

/// Font metrics measured by the terminal widget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontMetrics {
    pub font_size: f64,
    /// Cell width in pixels at `font_size`.
    pub cell_width: f64,
    /// Cell height in pixels at `font_size`.
    pub cell_height: f64,
}

impl FontMetrics {
    /// Metrics scale linearly with the font size.
    pub fn scaled(&self, font_size: f64) -> Self {
        let ratio = if self.font_size > 0.0 {
            font_size / self.font_size
        } else {
            1.0
        };
        Self {
            font_size,
            cell_width: self.cell_width * ratio,
            cell_height: self.cell_height * ratio,
        }
    }
}

/// Rendering area of one pane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaneGeometry {
    pub width_px: f64,
    pub height_px: f64,
    pub metrics: FontMetrics,
}

impl PaneGeometry {
    /// The grid this pane would show at its own font.
    pub fn natural_size(&self) -> GridSize {
        GridSize::new(
            cells(self.width_px, self.metrics.cell_width),
            cells(self.height_px, self.metrics.cell_height),
        )
    }
}

fn cells(extent: f64, cell: f64) -> u16 {
    if !(extent > 0.0 && cell > 0.0) {
        return 1;
    }
    let count = (extent / cell + EPSILON).floor();
    count.clamp(1.0, f64::from(u16::MAX)) as u16
}

/// Outcome of normalizing one pane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalized {
    /// The grid the pane must declare: always the session's reference.
    pub size: GridSize,
    /// Font size the pane should render at.
    pub font_size: f64,
    /// False when no font size reproduces the grid exactly in this pane's area.
    pub exact: bool,
}

#[derive(Debug, Clone)]
struct Reference {
    size: GridSize,
    holder: String,
    panes: BTreeSet<String>,
}

/// Per-multiplexer-session reference grids.
#[derive(Debug, Default)]
pub struct DimensionNormalizer {
    references: HashMap<String, Reference>,
}

impl DimensionNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference(&self, mux_name: &str) -> Option<GridSize> {
        self.references.get(mux_name).map(|reference| reference.size)
    }

    /// Pane ids currently rendering `mux_name`.
    pub fn panes(&self, mux_name: &str) -> Vec<String> {
        self.references
            .get(mux_name)
            .map(|reference| reference.panes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register `pane_id` before it attaches to `mux_name`.
    ///
    /// The first pane establishes the reference from its natural grid and keeps
    /// its own font. Every later pane gets a font fitted to the reference.
    pub fn attach(&mut self, mux_name: &str, pane_id: &str, geometry: &PaneGeometry) -> Normalized {
        match self.references.get_mut(mux_name) {
            Some(reference) => {
                reference.panes.insert(pane_id.to_string());
                let normalized = fit(reference.size, geometry);
                if !normalized.exact {
                    warn!(
                        session = %mux_name,
                        pane = %pane_id,
                        cols = reference.size.cols,
                        rows = reference.size.rows,
                        "pane cannot reproduce reference grid exactly"
                    );
                }
                debug!(session = %mux_name, pane = %pane_id, font = normalized.font_size, "normalized pane font");
                normalized
            }
            None => {
                let size = geometry.natural_size();
                info!(session = %mux_name, pane = %pane_id, cols = size.cols, rows = size.rows, "reference grid set");
                self.references.insert(
                    mux_name.to_string(),
                    Reference {
                        size,
                        holder: pane_id.to_string(),
                        panes: BTreeSet::from([pane_id.to_string()]),
                    },
                );
                Normalized {
                    size,
                    font_size: geometry.metrics.font_size,
                    exact: true,
                }
            }
        }
    }

    /// A pane's area changed.
    ///
    /// When the reference holder resizes, the reference follows it and every
    /// other pane must be refitted (see [`Self::refit`]). Other panes keep the
    /// reference and only adjust their font.
    pub fn resize(&mut self, mux_name: &str, pane_id: &str, geometry: &PaneGeometry) -> Option<Normalized> {
        let reference = self.references.get_mut(mux_name)?;
        if !reference.panes.contains(pane_id) {
            return None;
        }
        if reference.holder == pane_id {
            reference.size = geometry.natural_size();
            debug!(session = %mux_name, cols = reference.size.cols, rows = reference.size.rows, "reference grid moved");
            return Some(Normalized {
                size: reference.size,
                font_size: geometry.metrics.font_size,
                exact: true,
            });
        }
        Some(fit(reference.size, geometry))
    }

    /// Fit an already-attached non-holder pane to the current reference.
    pub fn refit(&self, mux_name: &str, geometry: &PaneGeometry) -> Option<Normalized> {
        self.references
            .get(mux_name)
            .map(|reference| fit(reference.size, geometry))
    }

    /// Drop `pane_id`. Returns true when that was the last pane and the
    /// reference was cleared. If the holder leaves first, the longest-standing
    /// remaining pane inherits the reference unchanged.
    pub fn release(&mut self, mux_name: &str, pane_id: &str) -> bool {
        let Some(reference) = self.references.get_mut(mux_name) else {
            return false;
        };
        reference.panes.remove(pane_id);
        if reference.panes.is_empty() {
            self.references.remove(mux_name);
            debug!(session = %mux_name, "reference grid cleared");
            return true;
        }
        if reference.holder == pane_id {
            if let Some(next) = reference.panes.iter().next().cloned() {
                reference.holder = next;
            }
        }
        false
    }
}

/// Pick a font size at which `geometry` shows exactly `target`.
///
/// Cell sizes scale linearly with the font (`cell = k * font`), so the set
/// of fonts producing `n` columns in width `W` is `(W / (k (n+1)), W / (k n)]`.
/// Rows give a second interval; any font in the intersection works.
fn fit(target: GridSize, geometry: &PaneGeometry) -> Normalized {
    let metrics = geometry.metrics;
    let preferred = metrics.font_size;
    if !(preferred > 0.0 && metrics.cell_width > 0.0 && metrics.cell_height > 0.0) {
        return Normalized {
            size: target,
            font_size: preferred,
            exact: false,
        };
    }
    let kw = metrics.cell_width / preferred;
    let kh = metrics.cell_height / preferred;
    let cols = f64::from(target.cols.max(1));
    let rows = f64::from(target.rows.max(1));

    let col_hi = geometry.width_px / (kw * cols);
    let col_lo = geometry.width_px / (kw * (cols + 1.0));
    let row_hi = geometry.height_px / (kh * rows);
    let row_lo = geometry.height_px / (kh * (rows + 1.0));
    let lo = col_lo.max(row_lo);
    let hi = col_hi.min(row_hi);

    if lo >= hi {
        // Aspect ratios disagree: shrink until the grid fits, leaving slack.
        return Normalized {
            size: target,
            font_size: hi,
            exact: false,
        };
    }
    let font_size = if preferred > lo && preferred <= hi {
        preferred
    } else if preferred > hi {
        hi
    } else {
        (lo + hi) / 2.0
    };
    let size = GridSize::new(
        cells(geometry.width_px, kw * font_size),
        cells(geometry.height_px, kh * font_size),
    );
    Normalized {
        size: target,
        font_size,
        exact: size == target,
    }
}
