//! The owning state of the daemon.
//!
//! Everything lives in one `State` value threaded through the calloop
//! sources and the Wayland dispatch impls; there are no globals and no
//! locks anywhere.

use anyhow::{bail, ensure, Context, Result};
use calloop::LoopSignal;
use wayland_client::globals::registry_queue_init;
use wayland_client::protocol::{wl_compositor, wl_keyboard, wl_output, wl_registry, wl_seat, wl_shm};
use wayland_client::{Connection, EventQueue, QueueHandle};
use wayland_protocols::xdg::xdg_output::zv1::client::{
    zxdg_output_manager_v1::ZxdgOutputManagerV1, zxdg_output_v1::ZxdgOutputV1,
};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_shell_v1::ZwlrLayerShellV1;
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use crate::cli::Cli;
use crate::clock::Clock;
use crate::devices::DeviceManager;
use crate::entropy::Entropy;
use crate::escape::EscapeCombo;
use crate::geometry::{GeometryEngine, OutputGeometry, MAX_OUTPUTS};
use crate::motion::MotionEngine;
use crate::overlay::DrawableLayer;
use crate::scheduler::Scheduler;
use crate::xkb::KeymapState;

/// Why the daemon is shutting down cleanly (exit code 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    EscapeCombo,
    CompositorGone,
    TimestampOverflow,
}

/// One advertised output: its registry identity, protocol objects, the
/// logical geometry being accumulated from xdg-output events, and the
/// overlay layer drawn onto it.
pub struct OutputSlot {
    pub registry_name: u32,
    pub output: wl_output::WlOutput,
    pub xdg_output: ZxdgOutputV1,
    /// Connector name (`DP-1`, ...), once the output sends it.
    pub name: Option<String>,
    pub pending: OutputGeometry,
    pub layer: DrawableLayer,
}

impl OutputSlot {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }
}

pub struct State {
    pub qh: QueueHandle<State>,
    pub conn: Connection,
    pub stop_signal: LoopSignal,
    pub exit: Option<ExitReason>,
    fatal: Option<anyhow::Error>,

    pub clock: Clock,
    pub entropy: Entropy,
    pub geometry: GeometryEngine,
    pub motion: MotionEngine,
    pub scheduler: Scheduler,
    pub escape: EscapeCombo,
    pub devices: DeviceManager,
    pub keymap: KeymapState,

    pub cursor_color: u32,

    pub compositor: wl_compositor::WlCompositor,
    pub shm: wl_shm::WlShm,
    pub layer_shell: ZwlrLayerShellV1,
    pub xdg_output_manager: ZxdgOutputManagerV1,
    pub virtual_pointer: ZwlrVirtualPointerV1,
    pub virtual_keyboard: ZwpVirtualKeyboardV1,
    pub seat: wl_seat::WlSeat,
    pub seat_name: Option<String>,
    pub keyboard: Option<wl_keyboard::WlKeyboard>,

    pub outputs: Vec<Option<OutputSlot>>,
}

impl State {
    /// Connects to the compositor, binds every required global, and builds
    /// the initial output slots. The caller still has to run two
    /// roundtrips to let the seat and keymap state settle.
    pub fn new(
        cli: &Cli,
        escape: EscapeCombo,
        conn: &Connection,
        stop_signal: LoopSignal,
    ) -> Result<(Self, EventQueue<Self>)> {
        let (globals, event_queue) = registry_queue_init::<Self>(conn)
            .context("could not initialize the Wayland registry")?;
        let qh = event_queue.handle();

        let compositor: wl_compositor::WlCompositor = globals
            .bind(&qh, 5..=5, ())
            .context("no wl_compositor v5 from compositor")?;
        let shm: wl_shm::WlShm = globals
            .bind(&qh, 2..=2, ())
            .context("no wl_shm v2 from compositor")?;
        let layer_shell: ZwlrLayerShellV1 = globals
            .bind(&qh, 4..=4, ())
            .context("no zwlr_layer_shell_v1 from compositor")?;
        let xdg_output_manager: ZxdgOutputManagerV1 = globals
            .bind(&qh, 3..=3, ())
            .context("no zxdg_output_manager_v1 from compositor")?;
        let virtual_pointer_manager: ZwlrVirtualPointerManagerV1 = globals
            .bind(&qh, 2..=2, ())
            .context("no zwlr_virtual_pointer_manager_v1 from compositor")?;
        let virtual_keyboard_manager: ZwpVirtualKeyboardManagerV1 = globals
            .bind(&qh, 1..=1, ())
            .context("no zwp_virtual_keyboard_manager_v1 from compositor")?;

        let contents = globals.contents().clone_list();

        let seats = contents
            .iter()
            .filter(|global| global.interface == "wl_seat")
            .count();
        if seats > 1 {
            warn!("multiple seats detected, all but the first will be ignored");
        }
        let seat: wl_seat::WlSeat = globals
            .bind(&qh, 9..=9, ())
            .context("no wl_seat v9 from compositor")?;

        let virtual_pointer = virtual_pointer_manager.create_virtual_pointer(None, &qh, ());
        let virtual_keyboard = virtual_keyboard_manager.create_virtual_keyboard(&seat, &qh, ());

        let mut state = Self {
            qh: qh.clone(),
            conn: conn.clone(),
            stop_signal,
            exit: None,
            fatal: None,

            clock: Clock::new(),
            entropy: Entropy::new(),
            geometry: GeometryEngine::new(),
            motion: MotionEngine::new(),
            scheduler: Scheduler::new(cli.delay),
            escape,
            devices: DeviceManager::new(),
            keymap: KeymapState::new(),

            cursor_color: cli.color,

            compositor,
            shm,
            layer_shell,
            xdg_output_manager,
            virtual_pointer,
            virtual_keyboard,
            seat,
            seat_name: None,
            keyboard: None,

            outputs: (0..MAX_OUTPUTS).map(|_| None).collect(),
        };

        for global in &contents {
            if global.interface == "wl_output" {
                state.add_output(globals.registry(), global.name, global.version)?;
            }
        }
        ensure!(
            state.outputs.iter().any(Option::is_some),
            "no wl_output objects from compositor"
        );

        Ok((state, event_queue))
    }

    /// Binds a newly advertised output into a free slot and creates its
    /// overlay layer.
    pub fn add_output(
        &mut self,
        registry: &wl_registry::WlRegistry,
        name: u32,
        version: u32,
    ) -> Result<()> {
        ensure!(
            version >= 4,
            "compositor advertises wl_output v{version}, need v4"
        );

        let Some(idx) = self.outputs.iter().position(Option::is_none) else {
            bail!("cannot handle more than {MAX_OUTPUTS} displays attached at once");
        };

        let output: wl_output::WlOutput = registry.bind(name, 4, &self.qh, idx);
        let xdg_output = self.xdg_output_manager.get_xdg_output(&output, &self.qh, idx);
        let layer = DrawableLayer::new(
            &self.compositor,
            &self.layer_shell,
            &output,
            &self.qh,
            idx,
        );

        debug!("added output {name} in slot {idx}");
        self.outputs[idx] = Some(OutputSlot {
            registry_name: name,
            output,
            xdg_output,
            name: None,
            pending: OutputGeometry::default(),
            layer,
        });
        Ok(())
    }

    /// Tears down the slot of a removed global, if it was an output.
    pub fn remove_output(&mut self, name: u32) -> Result<()> {
        let Some(idx) = self.outputs.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|slot| slot.registry_name == name)
        }) else {
            return Ok(());
        };

        let mut slot = self.outputs[idx].take().unwrap();
        debug!("removing output {} from slot {idx}", slot.label());
        slot.layer.destroy();
        slot.xdg_output.destroy();
        slot.output.release();
        self.geometry.update(idx, None)
    }

    /// Publishes the accumulated xdg-output geometry once the output sends
    /// `done`. An all-zero pending geometry means not every field arrived
    /// yet; such updates are dropped silently.
    pub fn publish_output_geometry(&mut self, idx: usize) -> Result<()> {
        let Some(slot) = self.outputs.get(idx).and_then(Option::as_ref) else {
            return Ok(());
        };
        let pending = slot.pending;
        if pending == OutputGeometry::default() {
            return Ok(());
        }

        debug!(
            "output {} at {},{} size {}x{}",
            slot.label(),
            pending.x,
            pending.y,
            pending.width,
            pending.height,
        );
        self.geometry.update(idx, Some(pending))?;

        if !self.motion.is_initialized() {
            let first = self.geometry.first_populated().unwrap();
            let origin = self.geometry.local_to_abs(0, 0, first);
            self.motion.reset_to(origin.x, origin.y);
        }
        Ok(())
    }

    /// Handles a layer-surface configure for the given output slot, then
    /// puts a first frame onto it.
    pub fn configure_layer(
        &mut self,
        idx: usize,
        serial: u32,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let Some(slot) = self.outputs.get_mut(idx).and_then(Option::as_mut) else {
            return Ok(());
        };
        slot.layer
            .configure(serial, width, height, &self.shm, &mut self.entropy, &self.qh)?;

        self.draw_pending_frames();
        Ok(())
    }

    /// Redraws every layer with a pending frame. Layers whose buffers are
    /// all held by the compositor defer silently.
    pub fn draw_pending_frames(&mut self) {
        let (cursor_x, cursor_y) = self.motion.cursor();
        let on_screen = cursor_x >= 0.0
            && cursor_x < f64::from(i32::MAX)
            && cursor_y >= 0.0
            && cursor_y < f64::from(i32::MAX);
        let scr = if on_screen {
            self.geometry.abs_to_local(cursor_x as i32, cursor_y as i32)
        } else {
            Default::default()
        };

        let color = self.cursor_color;
        let qh = self.qh.clone();
        for (idx, slot) in self.outputs.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            if !slot.layer.frame_pending {
                continue;
            }
            let local = (scr.valid && scr.output_idx == idx).then_some((scr.x, scr.y));
            slot.layer.draw_frame(local, color, &qh, idx);
        }
    }

    /// Parks a fatal error to be propagated out of the event loop.
    pub fn set_fatal(&mut self, err: anyhow::Error) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        self.stop_signal.stop();
    }

    /// Requests a clean exit.
    pub fn request_exit(&mut self, reason: ExitReason) {
        if self.exit.is_none() {
            self.exit = Some(reason);
        }
        self.stop_signal.stop();
    }

    /// One event-loop turn after dispatch: propagate parked errors,
    /// release due packets, redraw, flush.
    pub fn turn(&mut self) -> Result<()> {
        if let Some(err) = self.fatal.take() {
            return Err(err);
        }

        self.release_scheduled_events()?;
        self.draw_pending_frames();
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        use wayland_client::backend::WaylandError;

        match self.conn.flush() {
            Ok(()) => Ok(()),
            Err(WaylandError::Io(err))
                if err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            Err(WaylandError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                self.request_exit(ExitReason::CompositorGone);
                Ok(())
            }
            Err(err) => {
                Err(anyhow::Error::new(err).context("could not flush the Wayland connection"))
            }
        }
    }
}
