//! Execution context: which host this manager runs on.

/// Passed to every component that must choose between local and remote
/// command dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecContext {
    manager_address: String,
}

impl ExecContext {
    pub fn new(manager_address: impl Into<String>) -> Self {
        Self {
            manager_address: manager_address.into(),
        }
    }

    pub fn manager_address(&self) -> &str {
        &self.manager_address
    }

    /// True when commands for `address` run on this machine.
    pub fn is_local(&self, address: &str) -> bool {
        address == self.manager_address || matches!(address, "localhost" | "127.0.0.1")
    }
}
