//! Module views and deployment lifecycle
//!
//! `deployed: false → true` when the toolchain reports success,
//! `attested: → true` once attestation succeeds (only after deployment).

use crate::record::Record;

/// Read-only typed access to a module record
#[derive(Debug, Clone, Copy)]
pub struct ModuleView<'a> {
    record: &'a Record,
}

impl<'a> ModuleView<'a> {
    pub fn new(record: &'a Record) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &'a Record {
        self.record
    }

    pub fn name(&self) -> Option<&'a str> {
        self.record.get_str("name")
    }

    pub fn module_type(&self) -> Option<&'a str> {
        self.record.get_str("type")
    }

    pub fn node(&self) -> Option<&'a str> {
        self.record.get_str("node")
    }

    pub fn old_node(&self) -> Option<&'a str> {
        self.record.get_str("old_node")
    }

    pub fn priority(&self) -> Option<i64> {
        self.record.get_int("priority")
    }

    pub fn nonce(&self) -> i64 {
        self.record.get_int("nonce").unwrap_or(0)
    }

    pub fn is_deployed(&self) -> bool {
        self.record.get_bool("deployed").unwrap_or(false)
    }

    pub fn is_attested(&self) -> bool {
        self.record.get_bool("attested").unwrap_or(false)
    }

    /// Deployed and attested: keys may be set on it
    pub fn is_ready(&self) -> bool {
        self.is_deployed() && self.is_attested()
    }
}

/// Mutable access carrying the lifecycle transitions
#[derive(Debug)]
pub struct ModuleMut<'a> {
    record: &'a mut Record,
}

impl<'a> ModuleMut<'a> {
    pub fn new(record: &'a mut Record) -> Self {
        Self { record }
    }

    pub fn view(&self) -> ModuleView<'_> {
        ModuleView::new(self.record)
    }

    pub fn mark_deployed(&mut self) {
        self.record.set("deployed", true);
        log::info!("Module {} deployed", self.view().name().unwrap_or("?"));
    }

    pub fn mark_attested(&mut self) -> Result<(), LifecycleError> {
        if !self.view().is_deployed() {
            return Err(LifecycleError::NotDeployed(
                self.view().name().unwrap_or("?").to_string(),
            ));
        }
        self.record.set("attested", true);
        log::info!("Module {} attested", self.view().name().unwrap_or("?"));
        Ok(())
    }

    /// Return the current nonce and advance it. Called each time a key is
    /// set on the module so every set-key message is fresh.
    pub fn bump_nonce(&mut self) -> Result<i64, LifecycleError> {
        let current = self.view().nonce();
        let next = current.checked_add(1).ok_or_else(|| {
            LifecycleError::NonceExhausted(self.view().name().unwrap_or("?").to_string())
        })?;
        self.record.set("nonce", next);
        Ok(current)
    }

    /// Mark the module stale before redeploying it elsewhere: its current
    /// node becomes `old_node` and runtime state is cleared.
    pub fn clear_for_redeploy(&mut self, new_node: &str) {
        if let Some(node) = self.view().node().map(str::to_string) {
            self.record.set("old_node", node);
        }
        self.record.set("node", new_node);
        self.record.set("deployed", false);
        self.record.set("attested", false);
        self.record.remove("nonce");
    }
}

/// Invalid module lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("module '{0}' cannot be attested before it is deployed")]
    NotDeployed(String),

    #[error("module '{0}' has no nonces left")]
    NonceExhausted(String),
}
