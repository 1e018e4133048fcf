pub mod api;
pub mod lock;
pub mod poller;
pub mod realtime;
pub mod scheduler;
pub mod status;

pub use api::{ClaimOutcome, ControlPlane, HttpControlPlane};
pub use lock::PidLock;
pub use poller::Poller;
pub use realtime::RealtimeSubscriber;
pub use scheduler::{ExecutorJobs, JobRunner, RunnerEvent, Scheduler, SchedulerOptions, Teardown};
pub use status::StatusWriter;
