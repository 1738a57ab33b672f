//! Entry selection
//!
//! The interactive renderer lives outside the core; the pipeline only
//! needs something that answers "which entry next". [`AutoMenu`] is the
//! built-in answer: a countdown on the console, then the default entry,
//! then each remaining entry in turn as earlier ones fail.

use alloc::vec;
use alloc::vec::Vec;

use super::BootFailure;
use crate::config::BootConfig;
use crate::platform::Platform;

/// Keys are polled this often during the countdown.
const POLL_INTERVAL_US: u64 = 100_000;
const POLLS_PER_SECOND: u64 = 10;

const KEY_1: u16 = b'1' as u16;
const KEY_9: u16 = b'9' as u16;

pub trait Menu {
    /// Entry to try next, or `None` when nothing is left.
    fn select(&mut self, config: &BootConfig, platform: &mut dyn Platform) -> Option<usize>;

    /// The entry returned by the last `select` could not be booted.
    fn failed(&mut self, index: usize, failure: &BootFailure);
}

#[derive(Debug, Default)]
pub struct AutoMenu {
    failed: Vec<bool>,
    started: bool,
}

impl AutoMenu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count down `config.timeout` seconds. A digit key picks that entry,
    /// any other key boots the default straight away.
    fn countdown(&self, config: &BootConfig, platform: &mut dyn Platform, default: usize) -> usize {
        for (i, entry) in config.entries.iter().enumerate() {
            log::info!("{} {}) {}", if i == default { '*' } else { ' ' }, i + 1, entry.title);
        }

        for remaining in (1..=config.timeout).rev() {
            log::info!("Booting '{}' in {}s", config.entries[default].title, remaining);
            for _ in 0..POLLS_PER_SECOND {
                if let Some(key) = platform.poll_key() {
                    return match key {
                        KEY_1..=KEY_9 if ((key - KEY_1) as usize) < config.entries.len() => {
                            (key - KEY_1) as usize
                        }
                        _ => default,
                    };
                }
                platform.spin(POLL_INTERVAL_US);
            }
        }
        default
    }
}

impl Menu for AutoMenu {
    fn select(&mut self, config: &BootConfig, platform: &mut dyn Platform) -> Option<usize> {
        if config.entries.is_empty() {
            return None;
        }
        if self.failed.len() != config.entries.len() {
            self.failed = vec![false; config.entries.len()];
        }

        let default = config.default_index();
        if !self.started {
            self.started = true;
            return Some(self.countdown(config, platform, default));
        }

        // Next entry that has not failed yet, starting from the default.
        let n = config.entries.len();
        let next = (0..n).map(|i| (default + i) % n).find(|&i| !self.failed[i]);
        if let Some(index) = next {
            log::info!("Trying '{}'", config.entries[index].title);
        }
        next
    }

    fn failed(&mut self, index: usize, failure: &BootFailure) {
        log::debug!("menu: entry {} failed with {}", index, failure.error.kind_name());
        if let Some(slot) = self.failed.get_mut(index) {
            *slot = true;
        }
    }
}
