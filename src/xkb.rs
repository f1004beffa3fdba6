//! Keymap bookkeeping for the virtual keyboard.
//!
//! The compositor tells us the active keymap through `wl_keyboard`; we
//! forward the same fd to the virtual keyboard (so replayed keys are
//! interpreted identically) and compile it locally to track modifier
//! state for the snapshots attached to replayed keys.

use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};

use anyhow::{Context, Result};
use input::event::keyboard::KeyState;
use memmap2::MmapOptions;
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1;
use xkbcommon::xkb;

/// Serialized modifier state, in the shape `zwp_virtual_keyboard_v1`
/// expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModsSnapshot {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub group: u32,
}

pub struct KeymapState {
    context: xkb::Context,
    state: Option<xkb::State>,
    /// Raw bytes of the last accepted keymap, for change detection.
    raw: Option<Vec<u8>>,
}

impl KeymapState {
    pub fn new() -> Self {
        Self {
            context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            state: None,
            raw: None,
        }
    }

    /// Whether a keymap has been received and forwarded; key events cannot
    /// be replayed before this.
    pub fn ready(&self) -> bool {
        self.state.is_some()
    }

    /// Handles a `wl_keyboard.keymap` event: deduplicates against the
    /// previous map, forwards the fd to the virtual keyboard, and compiles
    /// the map for local modifier tracking.
    pub fn handle_keymap(
        &mut self,
        format: u32,
        fd: OwnedFd,
        size: u32,
        virtual_keyboard: &ZwpVirtualKeyboardV1,
    ) -> Result<()> {
        let file = File::from(fd);
        let map = unsafe {
            MmapOptions::new()
                .len(size as usize)
                .map_copy_read_only(&file)
        }
        .context("could not mmap the compositor keymap")?;

        if self.raw.as_deref() == Some(&map[..]) {
            return Ok(());
        }

        virtual_keyboard.keymap(format, file.as_fd(), size);

        let nul = map.iter().position(|&b| b == 0).unwrap_or(map.len());
        let text = std::str::from_utf8(&map[..nul])
            .context("compositor keymap is not valid UTF-8")?;
        let keymap = xkb::Keymap::new_from_string(
            &self.context,
            text.to_owned(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .context("could not compile the compositor keymap")?;

        self.state = Some(xkb::State::new(&keymap));
        self.raw = Some(map.to_vec());
        debug!("accepted a {size}-byte keymap");
        Ok(())
    }

    /// Feeds one key transition into the local XKB state and returns the
    /// serialized modifiers after the update, so modifier transitions stay
    /// attached to the key press that caused them.
    pub fn update_key(&mut self, key: u32, key_state: KeyState) -> Option<ModsSnapshot> {
        let state = self.state.as_mut()?;

        let direction = match key_state {
            KeyState::Pressed => xkb::KeyDirection::Down,
            KeyState::Released => xkb::KeyDirection::Up,
        };
        // XKB keycodes are evdev keycodes offset by 8.
        state.update_key((key + 8).into(), direction);

        Some(ModsSnapshot {
            depressed: state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: state.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        })
    }
}

impl Default for KeymapState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_without_keymap() {
        let mut keymap = KeymapState::new();
        assert!(!keymap.ready());
        assert_eq!(keymap.update_key(42, KeyState::Pressed), None);
    }

    #[test]
    fn tracks_shift_modifier() {
        let mut keymap = KeymapState::new();
        // Compile a default keymap directly instead of going through a
        // compositor fd.
        let compiled = xkb::Keymap::new_from_names(
            &keymap.context,
            "",
            "",
            "us",
            "",
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .unwrap();
        keymap.state = Some(xkb::State::new(&compiled));

        const KEY_LEFTSHIFT: u32 = 42;
        let pressed = keymap.update_key(KEY_LEFTSHIFT, KeyState::Pressed).unwrap();
        assert_ne!(pressed.depressed, 0);
        let released = keymap
            .update_key(KEY_LEFTSHIFT, KeyState::Released)
            .unwrap();
        assert_eq!(released.depressed, 0);
    }
}
