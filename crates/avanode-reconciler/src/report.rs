//! Operator-facing outcome summaries.

use std::fmt;
use std::path::PathBuf;

use avanode_store::{Network, Role, RpcScope};
use avanode_supervisor::ServiceStatus;

use crate::decision::ActionKind;
use crate::error::FailureClass;
use crate::host::HostPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    Succeeded,
    RolledBack,
    Failed,
}

impl FinalState {
    pub fn from_class(class: FailureClass) -> Self {
        match class {
            FailureClass::RolledBack => FinalState::RolledBack,
            _ => FinalState::Failed,
        }
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FinalState::Succeeded => "succeeded",
            FinalState::RolledBack => "rolled back",
            FinalState::Failed => "failed",
        })
    }
}

/// Result of a mutating operation that completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub operation: ActionKind,
    pub state: FinalState,

    /// Snapshots written or used, in the order they matter
    pub snapshots: Vec<PathBuf>,

    pub node_id: Option<String>,
    pub version: Option<String>,
    pub notes: Vec<String>,
}

impl OperationReport {
    pub fn succeeded(operation: ActionKind) -> Self {
        OperationReport {
            operation,
            state: FinalState::Succeeded,
            snapshots: Vec::new(),
            node_id: None,
            version: None,
            notes: Vec::new(),
        }
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshots.push(path.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

impl fmt::Display for OperationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.operation, self.state)?;
        for snapshot in &self.snapshots {
            writeln!(f, "  snapshot: {}", snapshot.display())?;
        }
        if let Some(version) = &self.version {
            writeln!(f, "  version:  {}", version)?;
        }
        if let Some(node_id) = &self.node_id {
            writeln!(f, "  node id:  {}", node_id)?;
        }
        for note in &self.notes {
            writeln!(f, "  note:     {}", note)?;
        }
        Ok(())
    }
}

/// Read-only summary for `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub phase: HostPhase,
    pub service: ServiceStatus,
    pub role: Option<Role>,
    pub network: Option<Network>,
    pub rpc_scope: Option<RpcScope>,
    pub binary_version: Option<String>,

    /// Filled only when the node answered RPC
    pub node_version: Option<String>,
    pub node_id: Option<String>,
    pub healthy: Option<bool>,
    pub bootstrapped: Option<bool>,

    pub snapshot_count: usize,
    pub latest_snapshot: Option<String>,
    pub offered: Vec<ActionKind>,
}

fn or_unknown<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "host:       {}", self.phase)?;
        writeln!(f, "service:    {}", self.service)?;
        writeln!(f, "role:       {}", or_unknown(&self.role))?;
        writeln!(f, "network:    {}", or_unknown(&self.network))?;
        writeln!(f, "rpc:        {}", or_unknown(&self.rpc_scope))?;
        writeln!(f, "binary:     {}", or_unknown(&self.binary_version))?;
        if let Some(version) = &self.node_version {
            writeln!(f, "node:       {}", version)?;
        }
        if let Some(node_id) = &self.node_id {
            writeln!(f, "node id:    {}", node_id)?;
        }
        if let Some(healthy) = self.healthy {
            writeln!(f, "healthy:    {}", healthy)?;
        }
        if let Some(bootstrapped) = self.bootstrapped {
            writeln!(f, "bootstrap:  {}", if bootstrapped { "done" } else { "in progress" })?;
        }
        match &self.latest_snapshot {
            Some(latest) => writeln!(f, "snapshots:  {} (latest {})", self.snapshot_count, latest)?,
            None => writeln!(f, "snapshots:  none")?,
        }
        let offered: Vec<String> = self.offered.iter().map(|a| a.to_string()).collect();
        writeln!(f, "available:  {}", offered.join(", "))
    }
}
