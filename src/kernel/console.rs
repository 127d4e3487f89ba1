//! Console device
//!
//! Descriptors 0, 1 and 2 talk to the console one character at a time and
//! never occupy open-file slots.

use super::lock;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Character device behind the console descriptors
pub trait Console: Send + Sync {
    /// Next input character, or `None` when input is exhausted
    fn getch(&self) -> Option<u8>;

    fn putch(&self, ch: u8);
}

/// A console backed by in-memory buffers
///
/// Input is pushed by the host; output accumulates until taken.
#[derive(Debug, Default)]
pub struct BufferConsole {
    input: Mutex<VecDeque<u8>>,
    output: Mutex<Vec<u8>>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push keyboard input
    pub fn push_input(&self, data: &[u8]) {
        lock(&self.input).extend(data);
    }

    /// Take output (for rendering)
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.output))
    }

    /// Copy of the output without consuming it
    pub fn peek_output(&self) -> Vec<u8> {
        lock(&self.output).clone()
    }

    pub fn clear_input(&self) {
        lock(&self.input).clear();
    }
}

impl Console for BufferConsole {
    fn getch(&self) -> Option<u8> {
        lock(&self.input).pop_front()
    }

    fn putch(&self, ch: u8) {
        lock(&self.output).push(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_io() {
        let console = BufferConsole::new();
        console.push_input(b"hi");
        assert_eq!(console.getch(), Some(b'h'));
        assert_eq!(console.getch(), Some(b'i'));
        assert_eq!(console.getch(), None);

        console.putch(b'o');
        console.putch(b'k');
        assert_eq!(console.peek_output(), b"ok");
        assert_eq!(console.take_output(), b"ok");
        assert!(console.take_output().is_empty());
    }

    #[test]
    fn test_clear_input() {
        let console = BufferConsole::new();
        console.push_input(b"stale");
        console.clear_input();
        assert_eq!(console.getch(), None);
    }
}
