//! Wayland event dispatch.

use anyhow::anyhow;
use wayland_client::globals::GlobalListContents;
use wayland_client::protocol::{
    wl_buffer, wl_compositor, wl_keyboard, wl_output, wl_region, wl_registry, wl_seat, wl_shm,
    wl_shm_pool, wl_surface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols::xdg::xdg_output::zv1::client::{
    zxdg_output_manager_v1::ZxdgOutputManagerV1,
    zxdg_output_v1::{self, ZxdgOutputV1},
};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::ZwlrLayerShellV1,
    zwlr_layer_surface_v1::{self, ZwlrLayerSurfaceV1},
};
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use crate::overlay::BufferData;
use crate::state::State;

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for State {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } if interface == "wl_output" => {
                if let Err(err) = state.add_output(registry, name, version) {
                    state.set_fatal(err);
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                if let Err(err) = state.remove_output(name) {
                    state.set_fatal(err);
                }
            }
            _ => (),
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for State {
    fn event(
        state: &mut Self,
        seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_seat::Event::Capabilities { capabilities } => {
                let has_keyboard = matches!(
                    capabilities,
                    WEnum::Value(caps) if caps.contains(wl_seat::Capability::Keyboard)
                );
                if !has_keyboard {
                    state.set_fatal(anyhow!(
                        "no keyboard capability for seat, cannot continue"
                    ));
                    return;
                }
                if state.keyboard.is_none() {
                    state.keyboard = Some(seat.get_keyboard(qh, ()));
                }
            }
            wl_seat::Event::Name { name } => state.seat_name = Some(name),
            _ => (),
        }
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, ()> for State {
    fn event(
        state: &mut Self,
        _keyboard: &wl_keyboard::WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        // Only the keymap matters; the compositor never routes real key
        // events to us (the overlay has an empty input region).
        if let wl_keyboard::Event::Keymap { format, fd, size } = event {
            let format = match format {
                WEnum::Value(format) => format as u32,
                WEnum::Unknown(format) => format,
            };
            if let Err(err) =
                state
                    .keymap
                    .handle_keymap(format, fd, size, &state.virtual_keyboard)
            {
                state.set_fatal(err);
            }
        }
    }
}

impl Dispatch<wl_output::WlOutput, usize> for State {
    fn event(
        state: &mut Self,
        _output: &wl_output::WlOutput,
        event: wl_output::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_output::Event::Name { name } => {
                if let Some(slot) = state.outputs.get_mut(*data).and_then(Option::as_mut) {
                    slot.name = Some(name);
                }
            }
            wl_output::Event::Done => {
                if let Err(err) = state.publish_output_geometry(*data) {
                    state.set_fatal(err);
                }
            }
            _ => (),
        }
    }
}

impl Dispatch<ZxdgOutputV1, usize> for State {
    fn event(
        state: &mut Self,
        _xdg_output: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(slot) = state.outputs.get_mut(*data).and_then(Option::as_mut) else {
            return;
        };
        match event {
            zxdg_output_v1::Event::LogicalPosition { x, y } => {
                slot.pending.x = x;
                slot.pending.y = y;
            }
            zxdg_output_v1::Event::LogicalSize { width, height } => {
                slot.pending.width = width;
                slot.pending.height = height;
            }
            _ => (),
        }
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, usize> for State {
    fn event(
        state: &mut Self,
        _layer_surface: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                if let Err(err) = state.configure_layer(*data, serial, width, height) {
                    state.set_fatal(err);
                }
            }
            zwlr_layer_surface_v1::Event::Closed => {
                warn!("compositor closed the overlay for output slot {data}");
            }
            _ => (),
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, BufferData> for State {
    fn event(
        state: &mut Self,
        buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        data: &BufferData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            let Some(slot) = state.outputs.get_mut(data.output).and_then(Option::as_mut)
            else {
                return;
            };
            // A release can race with output teardown; only free the slot
            // if this buffer still backs it.
            if slot.layer.owns_buffer(data.slot, buffer) {
                slot.layer.release_slot(data.slot);
            }
        }
    }
}

delegate_noop!(State: wl_compositor::WlCompositor);
delegate_noop!(State: ignore wl_shm::WlShm);
delegate_noop!(State: wl_shm_pool::WlShmPool);
delegate_noop!(State: ignore wl_surface::WlSurface);
delegate_noop!(State: wl_region::WlRegion);
delegate_noop!(State: ZwlrLayerShellV1);
delegate_noop!(State: ZxdgOutputManagerV1);
delegate_noop!(State: ZwlrVirtualPointerManagerV1);
delegate_noop!(State: ZwlrVirtualPointerV1);
delegate_noop!(State: ZwpVirtualKeyboardManagerV1);
delegate_noop!(State: ZwpVirtualKeyboardV1);
