//! # workpulse-process
//!
//! Runs installers and service-control commands for the WorkPulse updater:
//! unattended, output captured, killed with their whole process tree when
//! they overrun.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use workpulse_process::{ProcessConfig, ProcessManager};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProcessConfig::new("msiexec")
//!     .args(["/i", "agent.msi", "/qn", "/norestart"])
//!     .timeout(Duration::from_secs(600));
//!
//! let output = ProcessManager::new().run(config).await?;
//! println!("installer exited with {:?}", output.exit_code);
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod manager;

pub use child::{ManagedChild, ProcessOutput};
pub use config::ProcessConfig;
pub use error::{ProcessError, Result};
pub use manager::ProcessManager;
