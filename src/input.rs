//! Translation of libinput events into the jitter pipeline.
//!
//! Every drained event first feeds the escape-combo watcher, then either
//! updates the virtual cursor (motion) or turns into a replay-bound packet
//! handed to the scheduler.

use anyhow::{Context, Result};
use input::event::keyboard::{KeyState, KeyboardEventTrait};
use input::event::pointer::{Axis, PointerScrollEvent};
use input::event::{DeviceEvent, Event, EventTrait, KeyboardEvent, PointerEvent};

use crate::scheduler::{Payload, ScrollSource};
use crate::state::{ExitReason, State};

impl State {
    /// Drains the libinput context and processes every buffered event.
    pub fn pump_libinput(&mut self) -> Result<()> {
        self.devices
            .context
            .dispatch()
            .context("could not dispatch libinput events")?;

        while let Some(event) = self.devices.context.next() {
            self.handle_libinput_event(event)?;
            if self.exit.is_some() {
                break;
            }
        }
        Ok(())
    }

    fn handle_libinput_event(&mut self, event: Event) -> Result<()> {
        if let Event::Keyboard(KeyboardEvent::Key(ref key_event)) = event {
            let pressed = key_event.key_state() == KeyState::Pressed;
            if self.escape.feed(key_event.key(), pressed) {
                info!("escape key combination pressed");
                self.request_exit(ExitReason::EscapeCombo);
                return Ok(());
            }
        }

        match event {
            Event::Device(DeviceEvent::Added(added)) => {
                let mut device = added.device();
                if device.config_tap_finger_count() > 0 {
                    if let Err(err) = device.config_tap_set_enabled(true) {
                        warn!(
                            "could not enable tap-to-click on {}: {err:?}",
                            device.name()
                        );
                    }
                }
            }
            Event::Pointer(PointerEvent::Motion(motion)) => {
                self.motion
                    .apply_relative(motion.dx(), motion.dy(), &self.geometry);
                self.queue_motion_update()?;
            }
            Event::Pointer(PointerEvent::MotionAbsolute(motion)) => {
                let extent = self.geometry.extent();
                let x = motion.absolute_x_transformed(extent.x as u32);
                let y = motion.absolute_y_transformed(extent.y as u32);
                self.motion.apply_absolute(x, y);
                self.queue_motion_update()?;
            }
            Event::Pointer(PointerEvent::Button(button)) => {
                self.enqueue(Payload::Button {
                    button: button.button(),
                    state: button.button_state(),
                })?;
            }
            Event::Pointer(PointerEvent::ScrollWheel(scroll)) => {
                self.enqueue_scroll(ScrollSource::Wheel, &scroll)?;
            }
            Event::Pointer(PointerEvent::ScrollFinger(scroll)) => {
                self.enqueue_scroll(ScrollSource::Finger, &scroll)?;
            }
            Event::Pointer(PointerEvent::ScrollContinuous(scroll)) => {
                self.enqueue_scroll(ScrollSource::Continuous, &scroll)?;
            }
            Event::Keyboard(KeyboardEvent::Key(key_event)) => {
                let key = key_event.key();
                let key_state = key_event.key_state();
                // Snapshot the modifiers right after this key updates them,
                // so the transition replays together with the key itself.
                let mods = self.keymap.update_key(key, key_state);
                self.enqueue(Payload::Key {
                    key,
                    state: key_state,
                    mods,
                })?;
            }
            other => trace!("ignoring libinput event {other:?}"),
        }
        Ok(())
    }

    fn enqueue_scroll(
        &mut self,
        source: ScrollSource,
        event: &impl PointerScrollEvent,
    ) -> Result<()> {
        let horizontal = event
            .has_axis(Axis::Horizontal)
            .then(|| event.scroll_value(Axis::Horizontal));
        let vertical = event
            .has_axis(Axis::Vertical)
            .then(|| event.scroll_value(Axis::Vertical));
        self.enqueue(Payload::Scroll {
            source,
            horizontal,
            vertical,
        })
    }

    fn enqueue(&mut self, payload: Payload) -> Result<()> {
        let now = self.clock.now();
        self.scheduler.enqueue(payload, now, &mut self.entropy)
    }

    /// Glides the cursor to its new position, marks the affected overlays
    /// for redraw, and coalesces the update into the queue tail where
    /// possible.
    fn queue_motion_update(&mut self) -> Result<()> {
        let outcome = self.motion.relocate(&self.geometry)?;

        for idx in outcome.dirty {
            if let Some(slot) = self.outputs.get_mut(idx).and_then(Option::as_mut) {
                slot.layer.frame_pending = true;
            }
        }

        if !self.scheduler.coalesce_motion(outcome.x, outcome.y) {
            self.enqueue(Payload::Motion {
                x: outcome.x,
                y: outcome.y,
            })?;
        }
        Ok(())
    }
}
