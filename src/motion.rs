//! Virtual cursor state and wall-glide clamping.
//!
//! The cursor cannot simply jump to wherever a motion event says: on
//! multi-monitor layouts the bounding box of all outputs may contain
//! regions no output covers, and the cursor must never land there. Motion
//! is therefore walked pixel by pixel from the previous position, and when
//! the walk leaves every output it backs up one pixel on the offending
//! axis and continues along the boundary.

use anyhow::{bail, ensure, Result};

use crate::geometry::{traverse_line, GeometryEngine, Point};

/// Iteration cap for a single glide. A walk is bounded by the taxicab
/// length of the global space times a handful of wall restarts; anything
/// past this is a corrupted traversal.
const GLIDE_STEP_LIMIT: u32 = 1_000_000;

/// Committed cursor movement: the final global-space position and the
/// outputs whose overlays need a redraw.
#[derive(Debug, Clone, Copy)]
pub struct GlideOutcome {
    pub x: i32,
    pub y: i32,
    pub dirty: [usize; 2],
}

#[derive(Debug)]
pub struct MotionEngine {
    cur: (f64, f64),
    prev: (f64, f64),
    initialized: bool,
}

impl MotionEngine {
    pub fn new() -> Self {
        Self {
            cur: (0.0, 0.0),
            prev: (0.0, 0.0),
            initialized: false,
        }
    }

    pub fn cursor(&self) -> (f64, f64) {
        self.cur
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Pins both cursor points to a known-good location.
    pub fn reset_to(&mut self, x: i32, y: i32) {
        self.cur = (f64::from(x), f64::from(y));
        self.prev = self.cur;
        self.initialized = true;
    }

    /// Applies a relative motion delta, clamped into the global space.
    pub fn apply_relative(&mut self, dx: f64, dy: f64, geometry: &GeometryEngine) {
        let origin = geometry.origin();
        let extent = geometry.extent();

        self.prev = self.cur;
        self.cur.0 += dx;
        self.cur.1 += dy;

        self.cur.0 = self
            .cur
            .0
            .clamp(f64::from(origin.x), f64::from(extent.x - 1));
        self.cur.1 = self
            .cur
            .1
            .clamp(f64::from(origin.y), f64::from(extent.y - 1));
    }

    /// Applies an absolute position already transformed into global space.
    pub fn apply_absolute(&mut self, x: f64, y: f64) {
        self.prev = self.cur;
        self.cur = (x, y);
    }

    /// Walks from the previous position to the current one, gliding along
    /// output boundaries, and commits the clamped endpoint.
    pub fn relocate(&mut self, geometry: &GeometryEngine) -> Result<GlideOutcome> {
        ensure!(
            !geometry.is_empty(),
            "no outputs available for cursor placement"
        );

        let mut prev_scr = {
            ensure!(
                self.prev.0 >= 0.0 && self.prev.0 < f64::from(i32::MAX),
                "previous cursor x out of range"
            );
            ensure!(
                self.prev.1 >= 0.0 && self.prev.1 < f64::from(i32::MAX),
                "previous cursor y out of range"
            );
            geometry.abs_to_local(self.prev.0 as i32, self.prev.1 as i32)
        };

        if !prev_scr.valid {
            // The previous coordinate points at a spot no output covers,
            // which can happen right after outputs are rearranged. Snap
            // everything to the first populated output and carry on.
            debug!("cursor position lost its output, resetting");
            let idx = geometry.first_populated().unwrap();
            let sane = geometry.local_to_abs(0, 0, idx);
            self.reset_to(sane.x, sane.y);
            prev_scr = geometry.abs_to_local(sane.x, sane.y);
        }

        ensure!(
            self.cur.0 >= 0.0 && self.cur.0 < f64::from(i32::MAX),
            "cursor x out of range"
        );
        ensure!(
            self.cur.1 >= 0.0 && self.cur.1 < f64::from(i32::MAX),
            "cursor y out of range"
        );

        let mut start = Point {
            x: self.prev.0 as i32,
            y: self.prev.1 as i32,
        };
        let mut end = Point {
            x: self.cur.0 as i32,
            y: self.cur.1 as i32,
        };

        let mut prev_trav = start;
        let mut end_x_hit = false;
        let mut end_y_hit = false;
        let mut steps = 0u32;
        let mut i = 0i32;
        loop {
            steps += 1;
            if steps > GLIDE_STEP_LIMIT {
                bail!("cursor glide failed to converge");
            }

            let trav = traverse_line(start, end, i);
            if trav.x == end.x {
                end_x_hit = true;
            }
            if trav.y == end.y {
                end_y_hit = true;
            }

            let trav_scr = geometry.abs_to_local(trav.x, trav.y);
            if !trav_scr.valid {
                // Find the axis we moved along when we left the screen and
                // back up one pixel on that axis alone. If that lands on a
                // screen, the rest of the path collapses to a straight
                // line along the other axis.
                if prev_trav.x < trav.x
                    && geometry.abs_to_local(trav.x - 1, trav.y).valid
                {
                    start = Point {
                        x: trav.x - 1,
                        y: trav.y,
                    };
                    end.x = trav.x - 1;
                    end_x_hit = false;
                    end_y_hit = false;
                    i = 0;
                    continue;
                }
                if prev_trav.x > trav.x
                    && geometry.abs_to_local(trav.x + 1, trav.y).valid
                {
                    start = Point {
                        x: trav.x + 1,
                        y: trav.y,
                    };
                    end.x = trav.x + 1;
                    end_x_hit = false;
                    end_y_hit = false;
                    i = 0;
                    continue;
                }
                if prev_trav.y < trav.y
                    && geometry.abs_to_local(trav.x, trav.y - 1).valid
                {
                    start = Point {
                        x: trav.x,
                        y: trav.y - 1,
                    };
                    end.y = trav.y - 1;
                    end_x_hit = false;
                    end_y_hit = false;
                    i = 0;
                    continue;
                }
                if prev_trav.y > trav.y
                    && geometry.abs_to_local(trav.x, trav.y + 1).valid
                {
                    start = Point {
                        x: trav.x,
                        y: trav.y + 1,
                    };
                    end.y = trav.y + 1;
                    end_x_hit = false;
                    end_y_hit = false;
                    i = 0;
                    continue;
                }
                bail!("cursor left the screen with no adjacent on-screen pixel");
            }

            if end_x_hit && end_y_hit {
                self.cur = (f64::from(end.x), f64::from(end.y));
                break;
            }

            prev_trav = trav;
            i += 1;
        }

        let scr = geometry.abs_to_local(self.cur.0 as i32, self.cur.1 as i32);
        ensure!(scr.valid, "glide committed an off-screen cursor");

        Ok(GlideOutcome {
            x: self.cur.0 as i32,
            y: self.cur.1 as i32,
            dirty: [prev_scr.output_idx, scr.output_idx],
        })
    }
}

impl Default for MotionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::OutputGeometry;

    fn geom(x: i32, y: i32, width: i32, height: i32) -> OutputGeometry {
        OutputGeometry {
            x,
            y,
            width,
            height,
        }
    }

    fn two_outputs() -> GeometryEngine {
        let mut engine = GeometryEngine::new();
        engine.update(0, Some(geom(0, 0, 1280, 720))).unwrap();
        engine.update(1, Some(geom(1280, 0, 1280, 720))).unwrap();
        engine
    }

    #[test]
    fn relative_motion_within_one_output() {
        let geometry = two_outputs();
        let mut motion = MotionEngine::new();
        motion.reset_to(100, 100);
        motion.apply_relative(5.0, 5.0, &geometry);
        let outcome = motion.relocate(&geometry).unwrap();
        assert_eq!((outcome.x, outcome.y), (105, 105));
        assert_eq!(outcome.dirty, [0, 0]);
    }

    #[test]
    fn clamped_at_shared_bottom_edge() {
        let geometry = two_outputs();
        let mut motion = MotionEngine::new();
        motion.reset_to(1279, 700);
        motion.apply_relative(5.0, 100.0, &geometry);
        let outcome = motion.relocate(&geometry).unwrap();
        // Both outputs end at y = 719; the remaining vertical motion is
        // clamped away and the horizontal part crosses onto output 1.
        assert_eq!((outcome.x, outcome.y), (1284, 719));
        assert_eq!(outcome.dirty, [0, 1]);
    }

    #[test]
    fn glides_along_wall_of_taller_output() {
        let mut geometry = GeometryEngine::new();
        geometry.update(0, Some(geom(0, 0, 1280, 720))).unwrap();
        geometry.update(1, Some(geom(1280, 0, 1280, 1024))).unwrap();

        let mut motion = MotionEngine::new();
        motion.reset_to(1000, 700);
        motion.apply_relative(300.0, 100.0, &geometry);
        let outcome = motion.relocate(&geometry).unwrap();
        // The path dips below output 0 before reaching output 1, so the
        // descent is cancelled and the cursor slides along y = 719.
        assert_eq!((outcome.x, outcome.y), (1300, 719));
        assert_eq!(outcome.dirty, [0, 1]);
    }

    #[test]
    fn clamp_keeps_cursor_inside_global_space() {
        let geometry = two_outputs();
        let mut motion = MotionEngine::new();
        motion.reset_to(10, 10);
        motion.apply_relative(-100.0, -100.0, &geometry);
        let outcome = motion.relocate(&geometry).unwrap();
        assert_eq!((outcome.x, outcome.y), (0, 0));
    }

    #[test]
    fn invalid_previous_position_resets() {
        let mut geometry = GeometryEngine::new();
        geometry.update(0, Some(geom(100, 0, 800, 600))).unwrap();

        let mut motion = MotionEngine::new();
        // (0, 0) is inside the bounding box arithmetic but not on the
        // output, which starts at x = 100.
        motion.apply_absolute(0.0, 0.0);
        let outcome = motion.relocate(&geometry).unwrap();
        assert_eq!((outcome.x, outcome.y), (100, 0));
    }

    #[test]
    fn dragging_coalesces_into_one_packet() {
        use crate::entropy::Entropy;
        use crate::scheduler::{Payload, Scheduler};

        let mut geometry = GeometryEngine::new();
        geometry.update(0, Some(geom(0, 0, 1920, 1080))).unwrap();

        let mut motion = MotionEngine::new();
        motion.reset_to(0, 0);
        let mut scheduler = Scheduler::new(100);
        let mut entropy = Entropy::new();

        for i in 0..10 {
            motion.apply_relative(5.0, 5.0, &geometry);
            let outcome = motion.relocate(&geometry).unwrap();
            if !scheduler.coalesce_motion(outcome.x, outcome.y) {
                scheduler
                    .enqueue(
                        Payload::Motion {
                            x: outcome.x,
                            y: outcome.y,
                        },
                        2000 + i,
                        &mut entropy,
                    )
                    .unwrap();
            }
        }

        assert_eq!(scheduler.len(), 1);
        let packet = scheduler.pop_due(5000).unwrap();
        assert_eq!(packet.payload, Payload::Motion { x: 50, y: 50 });
    }

    #[test]
    fn no_outputs_is_an_error() {
        let geometry = GeometryEngine::new();
        let mut motion = MotionEngine::new();
        motion.apply_absolute(10.0, 10.0);
        assert!(motion.relocate(&geometry).is_err());
    }
}
