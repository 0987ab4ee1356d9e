//! Terminal progress reporting for long-running discovery/apply phases.
//!
//! Two styles, matching how much is known up front: a rotating indicator
//! while the total node count is still being discovered, a percentage
//! bar once it is known and work against it is being applied. Both
//! print over themselves with a carriage return until the phase is
//! done, then leave a final line.

use crate::atomic::AtomicCounter;
use crate::error::TaskError;
use crate::task::TaskSystem;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const INDENT_WIDTH: usize = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const INDICATOR_CHARS: [char; 4] = ['-', '\\', '|', '/'];

pub struct ProgressPrinter {
    indent: String,
    bar_length: usize,
}

impl ProgressPrinter {
    #[must_use]
    pub fn new(indent: u32) -> Self {
        Self {
            indent: " ".repeat(indent as usize * INDENT_WIDTH),
            bar_length: 40,
        }
    }

    /// Prints a rotating indicator for `value` until `done` is set, then
    /// a final "done!" line.
    pub fn show_indicator(&self, msg: &str, done: &AtomicBool, value: &AtomicCounter) {
        let mut char_idx = 0usize;
        let mut last_value = value.get() - 1;
        while !done.load(Ordering::SeqCst) {
            let val = value.get();
            print!("{}{msg} {}\r", self.indent, INDICATOR_CHARS[char_idx]);
            let _ = io::stdout().flush();
            if val != last_value {
                char_idx = (char_idx + 1) % INDICATOR_CHARS.len();
            }
            last_value = val;
            std::thread::sleep(POLL_INTERVAL);
        }
        println!("{}{msg} done!", self.indent);
    }

    /// Prints a `[###---]` bar for `value` out of `total` until `done`
    /// is set, then a final line.
    pub fn show_bar(&self, msg: &str, done: &AtomicBool, value: &AtomicCounter, total: i64) {
        let render = |val: i64, final_line: bool| {
            if total <= 0 {
                return;
            }
            let filled = (((val as f64 / total as f64) * self.bar_length as f64) as usize)
                .min(self.bar_length);
            let bar: String = "#".repeat(filled) + &"-".repeat(self.bar_length - filled);
            let pct = (val as f64 / total as f64) * 100.0;
            let end = if final_line { "\n" } else { "\r" };
            print!(
                "{}{msg}: [{bar}] {val}/{total} {pct:.2}%{end}",
                self.indent
            );
            let _ = io::stdout().flush();
        };
        while !done.load(Ordering::SeqCst) {
            render(value.get(), false);
            std::thread::sleep(POLL_INTERVAL);
        }
        render(value.get(), true);
    }
}

/// Runs one discovery-or-apply phase: builds a [`TaskSystem`], lets
/// `submit` queue its initial task(s), reports progress on a scoped
/// helper thread while the pool drains, then retires the pool and
/// returns the final node count.
///
/// `total`, when given, switches the display from a rotating indicator
/// to a percentage bar against that total (used for the apply phase,
/// once discovery has established how many nodes exist).
///
/// Progress display is driven by a plain `done` flag set once `finish()`
/// returns, rather than by [`TaskSystem::running`] as in the original:
/// workers only die on `shutdown`, which only happens after the scoped
/// progress thread would already need to have observed completion, so
/// tying the two together would deadlock. A dedicated flag sidesteps
/// that without changing what is displayed.
pub fn run_phase<F>(
    jobs: usize,
    max_retries: usize,
    queue_limit: usize,
    indent: u32,
    label: &str,
    total: Option<i64>,
    submit: F,
) -> Result<i64, TaskError>
where
    F: FnOnce(&TaskSystem, std::sync::Arc<AtomicCounter>),
{
    let ts = TaskSystem::new(jobs, max_retries, queue_limit);
    let counter = std::sync::Arc::new(AtomicCounter::new());
    submit(&ts, std::sync::Arc::clone(&counter));

    let done = AtomicBool::new(false);
    let printer = ProgressPrinter::new(indent);
    std::thread::scope(|scope| {
        scope.spawn(|| match total {
            Some(total) => printer.show_bar(label, &done, &counter, total),
            None => printer.show_indicator(label, &done, &counter),
        });
        ts.finish();
        done.store(true, Ordering::SeqCst);
    });

    ts.join()?;
    Ok(counter.get())
}
