//! Process-wide defaults.
//!
//! Tasks and processes need two schedulers: one for their control messages
//! and one for the actual work. Both default to lazily created pooled
//! schedulers shared by the whole process; [`init`] forces creation up
//! front for programs that want the threads warm before first use.

use crate::scheduler::{PooledScheduler, Scheduler, SchedulerConfig};
use std::sync::{Arc, OnceLock};

static DEFAULT_SCHEDULER: OnceLock<Arc<PooledScheduler>> = OnceLock::new();
static DEFAULT_CONTROL_SCHEDULER: OnceLock<Arc<PooledScheduler>> = OnceLock::new();

/// The default work scheduler: `min_threads = 2`, `max_threads` = CPU count.
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    Arc::clone(DEFAULT_SCHEDULER.get_or_init(|| PooledScheduler::new(SchedulerConfig::default())))
        as Arc<dyn Scheduler>
}

/// The default control scheduler, kept separate from the work pool so bulky
/// work items cannot starve message dispatch.
pub fn default_control_scheduler() -> Arc<dyn Scheduler> {
    Arc::clone(DEFAULT_CONTROL_SCHEDULER.get_or_init(|| {
        PooledScheduler::new(SchedulerConfig::new(2, num_cpus::get().max(2)))
    })) as Arc<dyn Scheduler>
}

/// Create both default schedulers now instead of on first use.
pub fn init() {
    let _ = default_scheduler();
    let _ = default_control_scheduler();
}
