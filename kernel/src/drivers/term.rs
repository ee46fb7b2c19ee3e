//! Line-at-a-time keyboard input.
//!
//! A host thread blocks on stdin and hands each completed line to the
//! kernel; `read_line` blocks a minithread until one is available.

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Once;

use crate::machine::tas::TasLock;
use crate::sync::Semaphore;

static LINES: TasLock<VecDeque<String>> = TasLock::new(VecDeque::new());
static NEW_DATA: Semaphore = Semaphore::new(0);
static STARTED: Once = Once::new();

/// Start the stdin polling thread. Idempotent.
pub(crate) fn init() {
    STARTED.call_once(|| {
        std::thread::Builder::new()
            .name("term".into())
            .spawn(|| {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    match line {
                        Ok(l) => push_line(l),
                        Err(_) => break,
                    }
                }
            })
            .expect("term: failed to start reader thread");
    });
}

/// Deliver one input line. Exposed for feeding input programmatically.
pub fn push_line(line: String) {
    LINES.lock().push_back(line);
    NEW_DATA.v();
}

/// Block until a full input line is available and return it.
pub fn read_line() -> String {
    NEW_DATA.p();
    LINES.lock().pop_front().unwrap_or_default()
}
