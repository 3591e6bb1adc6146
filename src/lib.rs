pub mod config;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod name;
pub mod pid_store;
pub mod probe;
pub mod provision;
pub mod supervisor;
pub mod terminate;

pub use config::{Config, SupervisorConfig};
pub use error::{AppvisorError, Result};
pub use name::AppName;
pub use pid_store::PidStore;
pub use probe::{SystemUsage, Usage};
pub use provision::{ProvisionError, Provisioner, VenvProvisioner};
pub use supervisor::{AppStatus, StartOutcome, Supervisor};
pub use terminate::StopOutcome;
