//! Line input that does not stall the session.
//!
//! Stdin is read on a helper thread and forwarded over a channel, so the
//! main thread can keep firing loop timers while waiting for the listener.

use crossbeam_channel::{Receiver, TryRecvError};
use loopweave_core::Session;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long the session may wait between input checks.
const TICK: Duration = Duration::from_millis(10);

pub struct Console {
    lines: Receiver<String>,
}

impl Console {
    /// Start reading stdin on a background thread.
    pub fn stdin() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::Builder::new()
            .name("stdin".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to read input: {}", e);
                            break;
                        }
                    }
                }
            })
            .map(|_| ())
            .unwrap_or_else(|e| log::error!("Failed to spawn input thread: {}", e));
        Self { lines: rx }
    }

    /// Read lines from an existing channel.
    pub fn from_receiver(lines: Receiver<String>) -> Self {
        Self { lines }
    }

    /// Wait for the next line while the session keeps running.
    ///
    /// Returns `None` on end of input or when `shutdown` is raised.
    pub fn read_line(&self, session: &mut Session, shutdown: &AtomicBool) -> Option<String> {
        loop {
            session.pump();
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }
            match self.lines.try_recv() {
                Ok(line) => return Some(line.trim().to_string()),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {
                    session.wait_and_pump(TICK);
                }
            }
        }
    }
}
