//! Escape-combo watcher.
//!
//! The combo is an ordered list of groups, each holding interchangeable key
//! codes. The daemon terminates once every group has at least one of its
//! keys held down simultaneously. The watcher sits in front of the jitter
//! pipeline so the exit chord always works, no matter how congested the
//! queue is.

use anyhow::{bail, Result};

use crate::keycodes;

pub const DEFAULT_COMBO: &str = "KEY_LEFTSHIFT,KEY_RIGHTSHIFT,KEY_ESC";

#[derive(Debug, Clone)]
pub struct EscapeCombo {
    groups: Vec<Vec<u32>>,
    satisfied: Vec<bool>,
}

impl EscapeCombo {
    /// Parses a combo description: groups separated by `,`, alternative key
    /// names within a group separated by `|`.
    pub fn parse(combo: &str) -> Result<Self> {
        let mut groups = Vec::new();
        for group in combo.split(',') {
            let mut keys = Vec::new();
            for name in group.split('|') {
                if name.is_empty() {
                    bail!("empty key name specified in escape key list");
                }
                match keycodes::lookup(name) {
                    Some(code) => keys.push(code),
                    None => bail!("unrecognized key name '{name}'"),
                }
            }
            groups.push(keys);
        }

        let satisfied = vec![false; groups.len()];
        Ok(Self { groups, satisfied })
    }

    /// Feeds one keyboard transition to the watcher. Returns true when the
    /// full combo is held.
    pub fn feed(&mut self, key: u32, pressed: bool) -> bool {
        for (idx, group) in self.groups.iter().enumerate() {
            if group.contains(&key) {
                self.satisfied[idx] = pressed;
            }
        }

        self.satisfied.iter().all(|s| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEFTSHIFT: u32 = 42;
    const RIGHTSHIFT: u32 = 54;
    const ESC: u32 = 1;

    #[test]
    fn default_combo_fires_in_order() {
        let mut combo = EscapeCombo::parse(DEFAULT_COMBO).unwrap();
        assert!(!combo.feed(LEFTSHIFT, true));
        assert!(!combo.feed(RIGHTSHIFT, true));
        assert!(combo.feed(ESC, true));
    }

    #[test]
    fn release_resets_group() {
        let mut combo = EscapeCombo::parse(DEFAULT_COMBO).unwrap();
        assert!(!combo.feed(LEFTSHIFT, true));
        assert!(!combo.feed(LEFTSHIFT, false));
        assert!(!combo.feed(RIGHTSHIFT, true));
        assert!(!combo.feed(ESC, true));
    }

    #[test]
    fn alternatives_within_group() {
        let mut combo = EscapeCombo::parse("KEY_LEFTSHIFT|KEY_RIGHTSHIFT,KEY_ESC").unwrap();
        assert!(!combo.feed(RIGHTSHIFT, true));
        assert!(combo.feed(ESC, true));
    }

    #[test]
    fn unrelated_keys_ignored() {
        let mut combo = EscapeCombo::parse(DEFAULT_COMBO).unwrap();
        assert!(!combo.feed(30, true));
        assert!(!combo.feed(30, false));
    }

    #[test]
    fn bad_names_rejected() {
        assert!(EscapeCombo::parse("KEY_NOPE").is_err());
        assert!(EscapeCombo::parse("KEY_ESC,").is_err());
        assert!(EscapeCombo::parse("KEY_ESC|").is_err());
    }
}
