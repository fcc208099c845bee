pub mod addressing;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod fairness;
pub mod lockable;
pub mod locks;
pub mod manager;
pub mod outcome;
pub mod ports;
pub mod records;
pub mod store;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, DirectorConfig, FairnessKind, VmCapacity};
pub use error::{DirectorError, Result, ResultCode};
pub use manager::{HostStateManager, MaintenanceHandle};
pub use outcome::{Outcome, WaitToken};
pub use ports::Ports;
pub use records::{BladeSpec, ResourceStatus, VmHardwareSpec, VmSoftwareSpec};
pub use store::{HostDb, MemoryHostDb, SqliteHostDb};
