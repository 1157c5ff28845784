use std::cell::Cell;
use std::fmt::Display;

use tracing::{info, warn, Level};

thread_local! {
    static RANK: Cell<usize> = const { Cell::new(0) };
}

/// Installs the fmt subscriber. Safe to call more than once.
pub fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .try_init();
}

/// Sets the rank the `rank_zero_*` helpers compare against on this thread.
pub fn set_rank(rank: usize) {
    RANK.with(|r| r.set(rank));
}

pub fn current_rank() -> usize {
    RANK.with(Cell::get)
}

pub fn rank_zero_info(message: impl Display) {
    if current_rank() == 0 {
        info!("{}", message);
    }
}

pub fn rank_zero_warn(message: impl Display) {
    if current_rank() == 0 {
        warn!("{}", message);
    }
}
