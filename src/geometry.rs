//! Output geometry tracking and the global coordinate space.
//!
//! Outputs live in fixed slots indexed by a small integer; the same index
//! keys the Wayland-side output state. The global space is the bounding box
//! of all advertised outputs, and the union must be free of gaps: cursor
//! motion is clamped against it, so a hole would let the cursor escape into
//! un-renderable territory.

use anyhow::{bail, ensure, Result};

pub const MAX_OUTPUTS: usize = 128;

/// Location and size of one output in compositor-global space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputGeometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl OutputGeometry {
    fn is_valid(&self) -> bool {
        self.x >= 0 && self.y >= 0 && self.width >= 0 && self.height >= 0
    }
}

/// A point in some output's local space, tagged with the owning output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScreenLocal {
    pub x: i32,
    pub y: i32,
    pub output_idx: usize,
    pub valid: bool,
}

/// A point in no particular space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Returns whether two outputs touch or overlap.
///
/// Growing one rectangle by a pixel on every side turns "touching"
/// (including corner-to-corner) into plain overlap, which is a single
/// interval test per axis.
fn outputs_touch(a: OutputGeometry, b: OutputGeometry) -> bool {
    if !a.is_valid() || !b.is_valid() {
        return false;
    }

    let ax1 = a.x - 1;
    let ay1 = a.y - 1;
    let ax2 = a.x + a.width + 1;
    let ay2 = a.y + a.height + 1;

    ax1 < b.x + b.width && b.x < ax2 && ay1 < b.y + b.height && b.y < ay2
}

/// The set of advertised outputs plus the derived global space.
#[derive(Debug)]
pub struct GeometryEngine {
    geometries: Vec<Option<OutputGeometry>>,
    /// Upper-left corner of the pointer space.
    origin: Point,
    /// One past the bottom-right corner across all outputs.
    extent: Point,
}

impl GeometryEngine {
    pub fn new() -> Self {
        Self {
            geometries: vec![None; MAX_OUTPUTS],
            origin: Point { x: 0, y: 0 },
            extent: Point { x: 0, y: 0 },
        }
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn extent(&self) -> Point {
        self.extent
    }

    pub fn geometry(&self, idx: usize) -> Option<OutputGeometry> {
        self.geometries.get(idx).copied().flatten()
    }

    pub fn first_populated(&self) -> Option<usize> {
        self.geometries.iter().position(|g| g.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.first_populated().is_none()
    }

    /// Installs (or clears) the geometry of one output slot and recomputes
    /// the global space.
    pub fn update(&mut self, idx: usize, geometry: Option<OutputGeometry>) -> Result<()> {
        ensure!(idx < MAX_OUTPUTS, "output index {idx} out of range");
        if let Some(geometry) = geometry {
            ensure!(
                geometry.width > 0 && geometry.height > 0,
                "output {idx} has a degenerate size {}x{}",
                geometry.width,
                geometry.height,
            );
        }
        self.geometries[idx] = geometry;
        self.recompute()
    }

    /// Recomputes the global-space corners and verifies the output union is
    /// connected.
    ///
    /// Incomplete state (no outputs with published geometry yet) is left
    /// alone silently; a disconnected configuration is a hard error.
    pub fn recompute(&mut self) -> Result<()> {
        let screens: Vec<OutputGeometry> = self
            .geometries
            .iter()
            .flatten()
            .copied()
            .filter(OutputGeometry::is_valid)
            .collect();
        if screens.is_empty() {
            return Ok(());
        }

        let mut ul = Point {
            x: i32::MAX,
            y: i32::MAX,
        };
        let mut br = Point { x: 0, y: 0 };
        for screen in &screens {
            ul.x = ul.x.min(screen.x);
            ul.y = ul.y.min(screen.y);
            let right = screen
                .x
                .checked_add(screen.width)
                .expect("output extends past the representable plane");
            let bottom = screen
                .y
                .checked_add(screen.height)
                .expect("output extends past the representable plane");
            br.x = br.x.max(right);
            br.y = br.y.max(bottom);
        }
        if ul.x > br.x || ul.y > br.y {
            return Ok(());
        }

        // Flood from screen 0 across the touching graph. Anything left
        // unreached sits across a gap the cursor could never glide over.
        let mut connected = vec![false; screens.len()];
        connected[0] = true;
        let mut frontier = vec![0usize];
        while let Some(cur) = frontier.pop() {
            for (idx, screen) in screens.iter().enumerate() {
                if !connected[idx] && outputs_touch(screens[cur], *screen) {
                    connected[idx] = true;
                    frontier.push(idx);
                }
            }
        }

        if connected.iter().any(|c| !c) {
            bail!(
                "multiple screens are attached and gaps are present between them; \
                 this configuration is unsupported"
            );
        }

        self.origin = ul;
        self.extent = br;
        Ok(())
    }

    /// Converts a global-space point to output-local coordinates. The first
    /// containing output wins; `valid` is false when no output covers the
    /// point.
    pub fn abs_to_local(&self, x: i32, y: i32) -> ScreenLocal {
        let mut out = ScreenLocal::default();
        if x < 0 || y < 0 {
            return out;
        }

        for (idx, geometry) in self.geometries.iter().enumerate() {
            let Some(g) = geometry else { continue };
            if !g.is_valid() {
                continue;
            }
            if x >= g.x && x < g.x + g.width && y >= g.y && y < g.y + g.height {
                out.x = x - g.x;
                out.y = y - g.y;
                out.output_idx = idx;
                out.valid = true;
                break;
            }
        }

        out
    }

    /// Converts output-local coordinates to global space. Returns `(-1, -1)`
    /// when the slot has no geometry or the inputs are negative.
    pub fn local_to_abs(&self, x: i32, y: i32, output_idx: usize) -> Point {
        let invalid = Point { x: -1, y: -1 };
        if x < 0 || y < 0 {
            return invalid;
        }
        let Some(g) = self.geometry(output_idx) else {
            return invalid;
        };
        if !g.is_valid() {
            return invalid;
        }
        Point {
            x: g.x + x,
            y: g.y + y,
        }
    }
}

impl Default for GeometryEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks `pos` pixels from `start` towards `end` along a straight line.
///
/// The walk can overshoot `end`, and `end` itself is not guaranteed to be
/// produced exactly; callers terminate by watching both coordinates reach
/// the endpoint values.
pub fn traverse_line(start: Point, end: Point, pos: i32) -> Point {
    if pos == 0 {
        return start;
    }

    let num = f64::from(end.y) - f64::from(start.y);
    let denom = f64::from(start.x) - f64::from(end.x);
    if denom == 0.0 {
        // vertical line
        return Point {
            x: start.x,
            y: if start.y < end.y {
                start.y + pos
            } else {
                start.y - pos
            },
        };
    }

    let steep = (num / denom).abs();
    if steep < 1.0 {
        Point {
            x: if start.x < end.x {
                start.x + pos
            } else {
                start.x - pos
            },
            y: if start.y < end.y {
                start.y + (f64::from(pos) * steep) as i32
            } else {
                start.y - (f64::from(pos) * steep) as i32
            },
        }
    } else {
        Point {
            x: if start.x < end.x {
                start.x + (f64::from(pos) / steep) as i32
            } else {
                start.x - (f64::from(pos) / steep) as i32
            },
            y: if start.y < end.y {
                start.y + pos
            } else {
                start.y - pos
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn geom(x: i32, y: i32, width: i32, height: i32) -> OutputGeometry {
        OutputGeometry {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn single_output_space() {
        let mut engine = GeometryEngine::new();
        engine.update(0, Some(geom(0, 0, 1920, 1080))).unwrap();
        assert_eq!(engine.origin(), Point { x: 0, y: 0 });
        assert_eq!(engine.extent(), Point { x: 1920, y: 1080 });
    }

    #[test]
    fn side_by_side_outputs_connect() {
        let mut engine = GeometryEngine::new();
        engine.update(0, Some(geom(0, 0, 1280, 720))).unwrap();
        engine.update(1, Some(geom(1280, 0, 1280, 720))).unwrap();
        assert_eq!(engine.extent(), Point { x: 2560, y: 720 });
    }

    #[test]
    fn corner_touch_connects() {
        let mut engine = GeometryEngine::new();
        engine.update(0, Some(geom(0, 0, 800, 600))).unwrap();
        engine.update(1, Some(geom(800, 600, 800, 600))).unwrap();
    }

    #[test]
    fn gap_is_fatal() {
        let mut engine = GeometryEngine::new();
        engine.update(0, Some(geom(0, 0, 800, 600))).unwrap();
        let err = engine.update(1, Some(geom(1000, 0, 800, 600))).unwrap_err();
        assert!(err.to_string().contains("gaps are present"));
    }

    #[test]
    fn gap_closed_by_removal() {
        let mut engine = GeometryEngine::new();
        engine.update(0, Some(geom(0, 0, 800, 600))).unwrap();
        engine.update(1, Some(geom(800, 0, 200, 600))).unwrap();
        // Dropping the bridge output leaves a single screen, which is
        // trivially connected again.
        engine.update(1, None).unwrap();
        assert_eq!(engine.extent(), Point { x: 800, y: 600 });
    }

    #[test]
    fn abs_to_local_picks_owner() {
        let mut engine = GeometryEngine::new();
        engine.update(0, Some(geom(0, 0, 1280, 720))).unwrap();
        engine.update(1, Some(geom(1280, 0, 1280, 720))).unwrap();

        let local = engine.abs_to_local(1300, 100);
        assert!(local.valid);
        assert_eq!(local.output_idx, 1);
        assert_eq!((local.x, local.y), (20, 100));

        assert!(!engine.abs_to_local(2600, 100).valid);
        assert!(!engine.abs_to_local(-1, 5).valid);
    }

    #[test]
    fn local_to_abs_empty_slot() {
        let engine = GeometryEngine::new();
        assert_eq!(engine.local_to_abs(0, 0, 3), Point { x: -1, y: -1 });
    }

    #[test]
    fn traverse_vertical() {
        let start = Point { x: 5, y: 10 };
        let end = Point { x: 5, y: 2 };
        assert_eq!(traverse_line(start, end, 0), start);
        assert_eq!(traverse_line(start, end, 3), Point { x: 5, y: 7 });
    }

    #[test]
    fn traverse_shallow() {
        let start = Point { x: 0, y: 0 };
        let end = Point { x: 10, y: 3 };
        let p = traverse_line(start, end, 10);
        assert_eq!(p.x, 10);
        assert_eq!(p.y, 3);
    }

    proptest! {
        #[test]
        fn traverse_reaches_both_axes(
            sx in -500i32..500,
            sy in -500i32..500,
            ex in -500i32..500,
            ey in -500i32..500,
        ) {
            let start = Point { x: sx, y: sy };
            let end = Point { x: ex, y: ey };
            let mut x_hit = false;
            let mut y_hit = false;
            // The walk advances the major axis one pixel per step, so both
            // axes must land within the taxicab distance plus slack.
            let bound = (ex - sx).abs() + (ey - sy).abs() + 2;
            for pos in 0..bound {
                let p = traverse_line(start, end, pos);
                if p.x == end.x { x_hit = true; }
                if p.y == end.y { y_hit = true; }
                if x_hit && y_hit { break; }
            }
            prop_assert!(x_hit && y_hit);
        }

        #[test]
        fn abs_local_round_trip(x in 0i32..2560, y in 0i32..720) {
            let mut engine = GeometryEngine::new();
            engine.update(0, Some(geom(0, 0, 1280, 720))).unwrap();
            engine.update(1, Some(geom(1280, 0, 1280, 720))).unwrap();

            let local = engine.abs_to_local(x, y);
            prop_assert!(local.valid);
            let back = engine.local_to_abs(local.x, local.y, local.output_idx);
            prop_assert_eq!(back, Point { x, y });
        }

        #[test]
        fn traverse_step_zero_is_start(
            sx in -500i32..500,
            sy in -500i32..500,
            ex in -500i32..500,
            ey in -500i32..500,
        ) {
            let start = Point { x: sx, y: sy };
            let end = Point { x: ex, y: ey };
            prop_assert_eq!(traverse_line(start, end, 0), start);
        }
    }
}
