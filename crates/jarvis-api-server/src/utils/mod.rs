pub mod clock;
pub mod error;
pub mod periodic;
pub mod token_estimator;

pub use clock::{Clock, ManualClock, RecordingSleeper, SharedClock, Sleeper, SystemClock, TokioSleeper};
pub use periodic::PeriodicTask;
