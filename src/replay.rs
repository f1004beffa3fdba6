//! Release of delayed events into the virtual input protocols.

use anyhow::{ensure, Result};
use input::event::keyboard::KeyState;
use input::event::pointer::ButtonState;
use wayland_client::protocol::wl_pointer;

use crate::scheduler::{InputPacket, Payload, ScrollSource};
use crate::state::{ExitReason, State};

impl State {
    /// Emits every queued packet whose deadline has passed.
    pub fn release_scheduled_events(&mut self) -> Result<()> {
        let now = self.clock.now();
        while let Some(packet) = self.scheduler.pop_due(now) {
            self.emit(packet)?;
            if self.exit.is_some() {
                break;
            }
        }
        Ok(())
    }

    fn emit(&mut self, packet: InputPacket) -> Result<()> {
        ensure!(packet.sched_time >= 0, "scheduled time went negative");
        if packet.sched_time > u32::MAX as i64 {
            // The wire protocol carries 32-bit millisecond timestamps. Not
            // an error, but the timeline cannot continue; a supervisor is
            // expected to restart us.
            info!("replay timestamp exceeded the 32-bit protocol range, exiting");
            self.request_exit(ExitReason::TimestampOverflow);
            return Ok(());
        }
        let time = packet.sched_time as u32;

        match packet.payload {
            Payload::Motion { x, y } => {
                let origin = self.geometry.origin();
                let extent = self.geometry.extent();
                ensure!(origin.x >= 0 && origin.y >= 0, "pointer space corrupted");
                ensure!(
                    x >= origin.x && y >= origin.y,
                    "queued cursor position left the pointer space"
                );
                ensure!(
                    extent.x >= origin.x && extent.y >= origin.y,
                    "global space corrupted"
                );

                self.virtual_pointer.motion_absolute(
                    time,
                    (x - origin.x) as u32,
                    (y - origin.y) as u32,
                    (extent.x - origin.x) as u32,
                    (extent.y - origin.y) as u32,
                );
                self.virtual_pointer.frame();
            }
            Payload::Button { button, state } => {
                let state = match state {
                    ButtonState::Pressed => wl_pointer::ButtonState::Pressed,
                    ButtonState::Released => wl_pointer::ButtonState::Released,
                };
                // libinput and the virtual-pointer protocol both use evdev
                // button codes, so the code passes straight through.
                self.virtual_pointer.button(time, button, state);
                self.virtual_pointer.frame();
            }
            Payload::Scroll {
                source,
                horizontal,
                vertical,
            } => {
                let wl_source = match source {
                    ScrollSource::Wheel => wl_pointer::AxisSource::Wheel,
                    ScrollSource::Finger => wl_pointer::AxisSource::Finger,
                    ScrollSource::Continuous => wl_pointer::AxisSource::Continuous,
                };

                if let Some(value) = vertical {
                    if value == 0.0 {
                        self.virtual_pointer
                            .axis_stop(time, wl_pointer::Axis::VerticalScroll);
                    } else {
                        self.virtual_pointer
                            .axis(time, wl_pointer::Axis::VerticalScroll, value);
                    }
                    self.virtual_pointer.axis_source(wl_source);
                }
                if let Some(value) = horizontal {
                    if value == 0.0 {
                        self.virtual_pointer
                            .axis_stop(time, wl_pointer::Axis::HorizontalScroll);
                    } else {
                        self.virtual_pointer
                            .axis(time, wl_pointer::Axis::HorizontalScroll, value);
                    }
                    self.virtual_pointer.axis_source(wl_source);
                }
                self.virtual_pointer.frame();
            }
            Payload::Key { key, state, mods } => {
                // Keys observed before the compositor handed us a keymap
                // carry no modifier snapshot and cannot be replayed in a
                // way the compositor would interpret correctly.
                let Some(mods) = mods else {
                    trace!("dropping key {key} observed before any keymap");
                    return Ok(());
                };
                self.virtual_keyboard.modifiers(
                    mods.depressed,
                    mods.latched,
                    mods.locked,
                    mods.group,
                );
                let state = match state {
                    KeyState::Pressed => 1,
                    KeyState::Released => 0,
                };
                self.virtual_keyboard.key(time, key, state);
            }
        }

        Ok(())
    }
}
