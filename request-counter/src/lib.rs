pub mod clock;
pub mod counter;
pub mod error;
pub mod persist_log;
pub mod sweeper;
pub mod timestamp;
pub mod window_store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{Counter, CounterConfig, CounterTasks};
pub use error::Error;
pub use persist_log::{LoadError, LoadReport, PersistenceLog, SyncPolicy};
pub use timestamp::Timestamp;
pub use window_store::WindowStore;
