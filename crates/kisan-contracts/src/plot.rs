use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Position normalized to the drawing surface: both axes in `[0, 100]`.
/// These are render-relative percentages, not geodetic coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(self, other: Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned rectangle in normalized units; `x, y` is the top-left
/// corner after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    /// Bounding box of two corner points, in either drag direction.
    pub fn bounding(a: Point, b: Point) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawTool {
    None,
    Polygon,
    Rectangle,
}

/// Tunable capture thresholds. The defaults match the dashboard's
/// observed behavior; none of them are algorithmic necessities.
#[derive(Debug, Clone, Copy)]
pub struct PlotConfig {
    /// Max distance from the first polygon vertex for a click to count
    /// as the close gesture.
    pub close_distance: f64,
    /// Rectangles thinner than this in either dimension are treated as
    /// pointer noise and discarded on release.
    pub min_rect_extent: f64,
    /// How long the analysis banner stays up before auto-dismissing.
    pub banner_ttl: Duration,
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            close_distance: 5.0,
            min_rect_extent: 2.0,
            banner_ttl: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone)]
struct Banner {
    text: String,
    expires_at: Instant,
}

/// Interactive plot capture over the normalized map surface.
///
/// Exactly one representation (polygon point list or rectangle) is live
/// at a time; selecting a tool discards any prior plot. Polygon closure
/// is inferred from geometry: a click near the first vertex closes the
/// shape instead of appending a vertex.
#[derive(Debug)]
pub struct PlotSession {
    config: PlotConfig,
    tool: DrawTool,
    points: Vec<Point>,
    rect: Option<Rect>,
    anchor: Option<Point>,
    interacting: bool,
    banner: Option<Banner>,
}

impl Default for PlotSession {
    fn default() -> Self {
        Self::new(PlotConfig::default())
    }
}

impl PlotSession {
    pub fn new(config: PlotConfig) -> Self {
        Self {
            config,
            tool: DrawTool::None,
            points: Vec::new(),
            rect: None,
            anchor: None,
            interacting: false,
            banner: None,
        }
    }

    pub fn active_tool(&self) -> DrawTool {
        self.tool
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn rectangle(&self) -> Option<Rect> {
        self.rect
    }

    pub fn is_interacting(&self) -> bool {
        self.interacting
    }

    /// Discards the current plot (both representations), then arms `tool`.
    /// Tools are mutually exclusive and never combined.
    pub fn select_tool(&mut self, tool: DrawTool) {
        self.clear();
        self.tool = tool;
    }

    /// Resets everything: points, rectangle, tool, banner. Idempotent.
    pub fn clear(&mut self) {
        self.points.clear();
        self.rect = None;
        self.tool = DrawTool::None;
        self.anchor = None;
        self.interacting = false;
        self.banner = None;
    }

    /// Begins a rectangle drag. No-op unless the rectangle tool is armed.
    pub fn pointer_down(&mut self, coord: Point) {
        if self.tool != DrawTool::Rectangle {
            return;
        }
        self.interacting = true;
        self.anchor = Some(coord);
        self.rect = Some(Rect {
            x: coord.x,
            y: coord.y,
            width: 0.0,
            height: 0.0,
        });
    }

    /// Recomputes the rectangle as the bounding box of the drag anchor
    /// and the current pointer position. Only while a drag is live.
    pub fn pointer_move(&mut self, coord: Point) {
        if self.tool != DrawTool::Rectangle || !self.interacting {
            return;
        }
        if let Some(anchor) = self.anchor {
            self.rect = Some(Rect::bounding(anchor, coord));
        }
    }

    /// Ends the drag. Sub-threshold rectangles are discarded as noise.
    /// The rectangle tool is single-shot: the tool disarms on release.
    pub fn pointer_up(&mut self) {
        if self.tool != DrawTool::Rectangle {
            return;
        }
        self.interacting = false;
        self.anchor = None;
        if let Some(rect) = self.rect {
            if rect.width < self.config.min_rect_extent || rect.height < self.config.min_rect_extent
            {
                self.rect = None;
            }
        }
        self.tool = DrawTool::None;
    }

    /// Adds a polygon vertex, or closes the polygon when the click lands
    /// within `close_distance` of the first vertex (with at least three
    /// vertices down). The closing click is not appended.
    pub fn click(&mut self, coord: Point) {
        if self.tool != DrawTool::Polygon {
            return;
        }
        if self.points.len() > 2 {
            let first = self.points[0];
            if first.distance_to(coord) < self.config.close_distance {
                self.tool = DrawTool::None;
                return;
            }
        }
        self.points.push(coord);
    }

    /// A plot counts as defined only once its tool has been put down:
    /// a closed polygon, or a persisted rectangle with positive extent.
    pub fn is_plot_defined(&self) -> bool {
        if self.tool != DrawTool::None {
            return false;
        }
        if self.points.len() > 2 {
            return true;
        }
        matches!(self.rect, Some(rect) if rect.width > 0.0 && rect.height > 0.0)
    }

    /// Shows the analysis banner. It auto-dismisses after the configured
    /// TTL; the drawn shape is untouched by the dismissal.
    pub fn set_banner(&mut self, text: impl Into<String>, now: Instant) {
        self.banner = Some(Banner {
            text: text.into(),
            expires_at: now + self.config.banner_ttl,
        });
    }

    /// Current banner text, expiring it first if its TTL has elapsed.
    pub fn banner_text(&mut self, now: Instant) -> Option<&str> {
        if let Some(banner) = &self.banner {
            if now >= banner.expires_at {
                self.banner = None;
            }
        }
        self.banner.as_ref().map(|banner| banner.text.as_str())
    }

    pub fn clear_banner(&mut self) {
        self.banner = None;
    }
}
