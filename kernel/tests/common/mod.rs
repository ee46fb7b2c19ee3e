//! Shared harness: one kernel per test binary, scenarios serialised.

#![allow(dead_code)]

use std::sync::Mutex;

use minios_kernel::Config;

static SCENARIO: Mutex<()> = Mutex::new(());

/// Initialize the kernel (first caller's config wins) and run `f` as a
/// minithread; scenarios in one binary run one at a time.
pub fn run_scenario<R, F>(config: Config, f: F) -> R
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let _serial = SCENARIO.lock().unwrap_or_else(|e| e.into_inner());
    minios_kernel::init(config);
    minios_kernel::run(f)
}
