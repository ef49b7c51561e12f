//! Bounded table-level worker pool. Tasks are self-contained (each opens its
//! own sessions); coordination is task completion only. A pool run returns
//! when every started task has finished, which doubles as the barrier
//! between restore stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::Result;
use tracing::error;

/// Runs `task` over `items` with at most `jobs` tasks in flight. The first
/// failure stops dispatch of further items; in-flight tasks drain and the
/// first error observed is returned.
///
/// # Errors
/// Returns the first task error.
pub fn run_tasks<T, F>(jobs: usize, items: Vec<T>, task: F) -> Result<()>
where
    T: Send,
    F: Fn(T) -> Result<()> + Send + Sync,
{
    if items.is_empty() {
        return Ok(());
    }
    let workers = jobs.max(1).min(items.len());
    let queue = Mutex::new(items.into_iter());
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if failed.load(Ordering::SeqCst) {
                    return;
                }
                let item = {
                    let mut queue = queue.lock().expect("task queue lock");
                    queue.next()
                };
                let Some(item) = item else {
                    return;
                };
                if let Err(err) = task(item) {
                    error!("worker failed: {err:#}");
                    failed.store(true, Ordering::SeqCst);
                    let mut slot = first_error.lock().expect("first error lock");
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            });
        }
    });

    match first_error.into_inner().expect("first error lock") {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
