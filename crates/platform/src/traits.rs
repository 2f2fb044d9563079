//! Core traits for Fynx security modules

use crate::FynxResult;

/// Security module interface
///
/// Long-running Fynx daemons implement this trait so a host process can
/// start, stop and inspect them uniformly.
pub trait SecurityModule {
    /// Unique module identifier
    fn id(&self) -> &'static str;

    /// Module version
    fn version(&self) -> &'static str;

    /// Module description
    fn description(&self) -> &'static str;

    /// Initialize the module
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails
    fn init(&mut self) -> FynxResult<()> {
        Ok(())
    }

    /// Shutdown the module
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&mut self) -> FynxResult<()> {
        Ok(())
    }

    /// Point-in-time status for monitoring
    fn status(&self) -> ModuleStatus {
        ModuleStatus::default()
    }
}

/// Status report of a running module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleStatus {
    /// Module finished `init` and has not been shut down
    pub running: bool,
    /// Number of live sessions or connections
    pub sessions: usize,
    /// Work items waiting on an external party
    pub backlog: usize,
}
