//! Per-output overlay layers and synthetic cursor rendering.
//!
//! Each output gets a full-size overlay `zwlr_layer_surface_v1` with an
//! empty input region, backed by one anonymous shm pool holding three
//! frames. A frame slot is only ever written while the compositor does not
//! hold it (tracked through `wl_buffer.release`), which is what makes the
//! shared pool safe without any synchronization.

use std::fs::File;
use std::os::fd::AsFd;

use anyhow::{bail, ensure, Context, Result};
use memmap2::{MmapMut, MmapOptions};
use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::shm::{shm_open, shm_unlink, ShmOFlags};
use wayland_client::protocol::{wl_compositor, wl_output, wl_shm, wl_shm_pool, wl_surface};
use wayland_client::QueueHandle;
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::{self, Layer},
    zwlr_layer_surface_v1::{self, Anchor},
};

use crate::entropy::Entropy;
use crate::state::State;

pub const FRAMES: usize = 3;
pub const CURSOR_RADIUS: i32 = 15;

const SHM_NAME_RETRIES: u32 = 100;

/// Ownership tag of one frame slot. `Drawing` only exists within a single
/// `draw_frame` call; `Committed` means the compositor may be reading the
/// slot and it must not be touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Drawing,
    Committed,
}

/// User data attached to every `wl_buffer`, so a release event can be
/// routed back to the slot it frees.
#[derive(Debug, Clone, Copy)]
pub struct BufferData {
    pub output: usize,
    pub slot: usize,
}

#[derive(Debug)]
struct FrameSlot {
    state: SlotState,
    buffer: Option<wayland_client::protocol::wl_buffer::WlBuffer>,
    /// Where the cursor was painted in this slot, for blanking once the
    /// slot is reused.
    cursor: Option<(i32, i32)>,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            state: SlotState::Idle,
            buffer: None,
            cursor: None,
        }
    }
}

/// One output's overlay surface plus its triple-buffered backing store.
#[derive(Debug)]
pub struct DrawableLayer {
    pub surface: wl_surface::WlSurface,
    pub layer_surface: zwlr_layer_surface_v1::ZwlrLayerSurfaceV1,
    pub configured: bool,
    pub frame_pending: bool,
    width: i32,
    height: i32,
    stride: i32,
    frame_size: usize,
    pool: Option<wl_shm_pool::WlShmPool>,
    map: Option<MmapMut>,
    slots: [FrameSlot; FRAMES],
    last_drawn_cursor: Option<(i32, i32)>,
}

impl DrawableLayer {
    /// Creates the overlay surface for an output and asks the compositor
    /// to configure it. Anchoring to all four edges with no size makes the
    /// layer span the whole output; the −1 exclusive zone keeps other
    /// clients from being reflowed around it.
    pub fn new(
        compositor: &wl_compositor::WlCompositor,
        layer_shell: &zwlr_layer_shell_v1::ZwlrLayerShellV1,
        output: &wl_output::WlOutput,
        qh: &QueueHandle<State>,
        output_idx: usize,
    ) -> Self {
        let surface = compositor.create_surface(qh, ());

        // The overlay must never take input away from the applications
        // underneath it.
        let region = compositor.create_region(qh, ());
        region.add(0, 0, 0, 0);
        surface.set_input_region(Some(&region));
        region.destroy();

        let layer_surface = layer_shell.get_layer_surface(
            &surface,
            Some(output),
            Layer::Overlay,
            "shroud".to_owned(),
            qh,
            output_idx,
        );
        layer_surface.set_anchor(Anchor::Top | Anchor::Bottom | Anchor::Left | Anchor::Right);
        layer_surface.set_exclusive_zone(-1);
        surface.commit();

        Self {
            surface,
            layer_surface,
            configured: false,
            frame_pending: true,
            width: 0,
            height: 0,
            stride: 0,
            frame_size: 0,
            pool: None,
            map: None,
            slots: [FrameSlot::new(), FrameSlot::new(), FrameSlot::new()],
            last_drawn_cursor: None,
        }
    }

    /// Handles a layer-surface configure: acks it and (re)allocates the
    /// shm pool when the size changed.
    pub fn configure(
        &mut self,
        serial: u32,
        width: u32,
        height: u32,
        shm: &wl_shm::WlShm,
        entropy: &mut Entropy,
        qh: &QueueHandle<State>,
    ) -> Result<()> {
        self.layer_surface.ack_configure(serial);

        ensure!(
            width > 0 && height > 0,
            "compositor configured a zero-sized layer"
        );
        ensure!(width <= i32::MAX as u32 / 4, "layer width out of range");
        ensure!(height <= i32::MAX as u32, "layer height out of range");

        let width = width as i32;
        let height = height as i32;
        if self.configured && width == self.width && height == self.height {
            return Ok(());
        }

        self.teardown_pool();

        self.width = width;
        self.height = height;
        self.stride = width
            .checked_mul(4)
            .context("layer stride overflowed")?;
        self.frame_size = self.stride as usize * height as usize;

        let total = self
            .frame_size
            .checked_mul(FRAMES)
            .context("shm pool size overflowed")?;
        ensure!(total <= i32::MAX as usize, "shm pool size out of range");
        let file = create_shm_file(total, entropy)?;
        let map = unsafe { MmapOptions::new().len(total).map_mut(&file) }
            .context("failed to map the shared memory block for frames")?;
        let pool = shm.create_pool(file.as_fd(), total as i32, qh, ());

        self.map = Some(map);
        self.pool = Some(pool);
        self.configured = true;
        self.frame_pending = true;
        Ok(())
    }

    /// Paints the synthetic cursor into a free frame slot and commits it.
    ///
    /// `local_cursor` is the cursor position in this output's local space,
    /// or `None` when the cursor sits on some other output. With all three
    /// slots held by the compositor the redraw is deferred; the next
    /// buffer release re-arms it.
    pub fn draw_frame(
        &mut self,
        local_cursor: Option<(i32, i32)>,
        color: u32,
        qh: &QueueHandle<State>,
        output_idx: usize,
    ) {
        if !self.configured {
            return;
        }
        let Some(slot_idx) = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Idle)
        else {
            return;
        };
        let (Some(map), Some(pool)) = (self.map.as_mut(), self.pool.as_ref()) else {
            return;
        };

        self.frame_pending = false;

        let slot = &mut self.slots[slot_idx];
        slot.state = SlotState::Drawing;

        let offset = slot_idx * self.frame_size;
        let pixels: &mut [u32] =
            bytemuck::cast_slice_mut(&mut map[offset..offset + self.frame_size]);

        // The compositor no longer reads this slot; wipe the stale cursor
        // footprint it may still carry.
        if let Some((x, y)) = slot.cursor.take() {
            draw_block(pixels, self.width, self.height, x, y, CURSOR_RADIUS, None);
        }

        let buffer = pool.create_buffer(
            offset as i32,
            self.width,
            self.height,
            self.stride,
            wl_shm::Format::Argb8888,
            qh,
            BufferData {
                output: output_idx,
                slot: slot_idx,
            },
        );

        if let Some((x, y)) = self.last_drawn_cursor {
            damage_around(&self.surface, x, y);
        }
        if let Some((x, y)) = local_cursor {
            draw_block(
                pixels,
                self.width,
                self.height,
                x,
                y,
                CURSOR_RADIUS,
                Some(color),
            );
            damage_around(&self.surface, x, y);
        }

        self.surface.attach(Some(&buffer), 0, 0);
        self.surface.commit();

        self.last_drawn_cursor = local_cursor;
        slot.cursor = local_cursor;
        slot.buffer = Some(buffer);
        slot.state = SlotState::Committed;
    }

    /// Marks a slot free again after the compositor released its buffer.
    /// Returns whether the layer wants a redraw.
    pub fn release_slot(&mut self, slot_idx: usize) -> bool {
        let slot = &mut self.slots[slot_idx];
        if let Some(buffer) = slot.buffer.take() {
            buffer.destroy();
        }
        slot.state = SlotState::Idle;
        self.frame_pending
    }

    /// Whether the given buffer proxy belongs to the given slot. A release
    /// for a buffer we already tore down (output removal) must not free a
    /// reused slot.
    pub fn owns_buffer(
        &self,
        slot_idx: usize,
        buffer: &wayland_client::protocol::wl_buffer::WlBuffer,
    ) -> bool {
        self.slots
            .get(slot_idx)
            .and_then(|slot| slot.buffer.as_ref())
            .is_some_and(|owned| owned == buffer)
    }

    fn teardown_pool(&mut self) {
        for slot in &mut self.slots {
            if let Some(buffer) = slot.buffer.take() {
                buffer.destroy();
            }
            slot.state = SlotState::Idle;
            slot.cursor = None;
        }
        if let Some(pool) = self.pool.take() {
            pool.destroy();
        }
        self.map = None;
        self.last_drawn_cursor = None;
    }

    /// Releases every compositor object owned by this layer.
    pub fn destroy(&mut self) {
        self.teardown_pool();
        self.layer_surface.destroy();
        self.surface.destroy();
        self.configured = false;
    }
}

/// Creates an anonymous shared-memory file of the given size.
///
/// The name is random and unlinked immediately after a successful
/// exclusive create, so nothing observable remains in the shm namespace.
fn create_shm_file(size: usize, entropy: &mut Entropy) -> Result<File> {
    ensure!(size <= i64::MAX as usize, "shm pool size out of range");

    for _ in 0..SHM_NAME_RETRIES {
        let name = format!("/shroud-{}", entropy.random_alpha(10)?);
        match shm_open(
            name.as_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => {
                shm_unlink(name.as_str())
                    .context("could not unlink the shared memory file")?;
                loop {
                    match rustix::fs::ftruncate(&fd, size as u64) {
                        Ok(()) => break,
                        Err(Errno::INTR) => continue,
                        Err(err) => {
                            return Err(err)
                                .context("could not allocate the shared memory block")
                        }
                    }
                }
                return Ok(File::from(fd));
            }
            Err(Errno::EXIST) => continue,
            Err(err) => return Err(err).context("could not create a shared memory file"),
        }
    }

    bail!("could not create a shared memory file: all names taken");
}

/// Paints (or blanks) the cursor block centered at `(x, y)`.
///
/// With a color, pixels on the center row or column become that color and
/// the rest of the block turns transparent; without one the whole block is
/// cleared.
pub fn draw_block(
    pixels: &mut [u32],
    layer_width: i32,
    layer_height: i32,
    x: i32,
    y: i32,
    rad: i32,
    color: Option<u32>,
) {
    let start_x = (x - rad).max(0);
    let start_y = (y - rad).max(0);
    let end_x = (x + rad).min(layer_width - 1);
    let end_y = (y + rad).min(layer_height - 1);

    for work_y in start_y..=end_y {
        for work_x in start_x..=end_x {
            let value = match color {
                Some(color) if work_x == x || work_y == y => color,
                _ => 0,
            };
            pixels[(work_y * layer_width + work_x) as usize] = value;
        }
    }
}

/// Damages the cursor block around `(x, y)`, clamping the origin into the
/// buffer. Negative origins upset some compositors.
fn damage_around(surface: &wl_surface::WlSurface, x: i32, y: i32) {
    let side = CURSOR_RADIUS * 2 + 2;
    surface.damage_buffer(
        (x - CURSOR_RADIUS).max(0),
        (y - CURSOR_RADIUS).max(0),
        side,
        side,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: i32 = 32;
    const H: i32 = 24;

    fn canvas() -> Vec<u32> {
        vec![0xdead_beef; (W * H) as usize]
    }

    fn px(pixels: &[u32], x: i32, y: i32) -> u32 {
        pixels[(y * W + x) as usize]
    }

    #[test]
    fn crosshair_rows_and_columns() {
        let mut pixels = canvas();
        draw_block(&mut pixels, W, H, 10, 10, 3, Some(0xffff0000));

        assert_eq!(px(&pixels, 10, 10), 0xffff0000);
        assert_eq!(px(&pixels, 7, 10), 0xffff0000);
        assert_eq!(px(&pixels, 10, 13), 0xffff0000);
        // Off-axis pixels inside the block become transparent.
        assert_eq!(px(&pixels, 8, 9), 0);
        // Pixels outside the block are untouched.
        assert_eq!(px(&pixels, 14, 10), 0xdead_beef);
        assert_eq!(px(&pixels, 10, 14), 0xdead_beef);
    }

    #[test]
    fn blank_clears_whole_block() {
        let mut pixels = canvas();
        draw_block(&mut pixels, W, H, 5, 5, 2, Some(0xffff0000));
        draw_block(&mut pixels, W, H, 5, 5, 2, None);
        for y in 3..=7 {
            for x in 3..=7 {
                assert_eq!(px(&pixels, x, y), 0);
            }
        }
    }

    #[test]
    fn clamps_at_edges() {
        let mut pixels = canvas();
        draw_block(&mut pixels, W, H, 0, 0, 3, Some(0xff00ff00));
        assert_eq!(px(&pixels, 0, 0), 0xff00ff00);
        assert_eq!(px(&pixels, 3, 0), 0xff00ff00);

        draw_block(&mut pixels, W, H, W - 1, H - 1, 3, Some(0xff00ff00));
        assert_eq!(px(&pixels, W - 1, H - 1), 0xff00ff00);
    }

    #[test]
    fn fully_offscreen_block_is_a_no_op() {
        let mut pixels = canvas();
        draw_block(&mut pixels, W, H, -10, -10, 3, Some(0xffffffff));
        draw_block(&mut pixels, W, H, W + 10, H + 10, 3, Some(0xffffffff));
        assert!(pixels.iter().all(|&p| p == 0xdead_beef));
    }
}
