//! Time-driven lifecycle: window generation, event discovery, dispatch, and the state
//! machines that run when a job fires.

pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod refresher;
pub mod windows;

pub use dispatcher::{EventHandler, Scheduler, SchedulerState};
pub use engine::{HandleOutcome, LifecycleEngine};
pub use events::{DueEvent, EventKind, JobKey};
pub use refresher::{EventRefresher, RefreshReport};
pub use windows::{GenerationReport, WindowGenerator};
