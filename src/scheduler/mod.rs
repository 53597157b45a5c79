mod state;

pub use state::{Scheduler, SchedulerRef, SchedulerRequest};
