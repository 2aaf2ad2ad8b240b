//! Butlers Scheduler - Cron-driven task firing.
//!
//! Tasks carry a 5-field UTC cron expression and one of two dispatch
//! modes: `prompt` (an LLM turn through the spawner) or `job` (a
//! registered native handler; no LLM, no cost). `tick()` is idempotent
//! within a scheduling cycle: firing is a compare-and-set on
//! `next_run_at`, so a task fires at most once per cron cycle no matter
//! how often the ticker runs.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod cron;
mod error;
mod jobs;
mod scheduler;
mod stagger;

pub use cron::CronSchedule;
pub use error::{SchedulerError, SchedulerResult};
pub use jobs::{JobRegistry, NativeJob};
pub use scheduler::{PromptDispatcher, Scheduler, TickReport};
pub use stagger::stagger_offset;
