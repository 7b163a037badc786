//! Terminal attached to the kernel's processes.
//!
//! Reads never block the machine: a process that wants a key with none
//! pending waits on the scheduler's `Input` event, and the machine only
//! sleeps in [`Console::wait_for_key`] when every task is idle.

use std::collections::VecDeque;
use std::time::Duration;

/// Character terminal seen by running processes.
pub trait Console: Send {
    /// Emit one character.
    fn write(&mut self, ch: u8);

    /// Next pending key, if any.
    fn get_key(&mut self) -> Option<u8>;

    /// Wait up to `timeout` for a key. Polls `get_key` by default.
    fn wait_for_key(&mut self, timeout: Duration) -> Option<u8> {
        let step = Duration::from_millis(1);
        let mut waited = Duration::ZERO;
        while waited < timeout {
            if let Some(key) = self.get_key() {
                return Some(key);
            }
            std::thread::sleep(step);
            waited += step;
        }
        self.get_key()
    }

    /// No further input can arrive; readers get end of input.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Scripted terminal: replays fixed input and records what processes
/// print. Closed once the script runs out.
#[derive(Default)]
pub struct HeadlessConsole {
    transcript: Vec<u8>,
    script: VecDeque<u8>,
}

impl HeadlessConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(script: &[u8]) -> Self {
        Self {
            transcript: Vec::new(),
            script: script.iter().copied().collect(),
        }
    }

    /// Everything written so far, lossily decoded.
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.transcript).into_owned()
    }
}

impl Console for HeadlessConsole {
    fn write(&mut self, ch: u8) {
        self.transcript.push(ch);
    }

    fn get_key(&mut self) -> Option<u8> {
        self.script.pop_front()
    }

    fn wait_for_key(&mut self, _timeout: Duration) -> Option<u8> {
        self.script.pop_front()
    }

    fn is_closed(&self) -> bool {
        self.script.is_empty()
    }
}
