pub mod executor;
pub mod scripts;
pub mod session;
pub mod setup;
pub mod timing;

pub use executor::{Executor, ExecutorConfig};
pub use timing::PhaseClock;
