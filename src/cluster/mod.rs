//! Cluster subsystem: master/worker topology and connection handoff.
//!
//! # Data Flow
//! ```text
//! Master:
//!     ClusterListener (Unix socket) ← workers connect, send hello
//!         → WorkerRegistry (snapshot per dispatch)
//!     Acceptor → RoundRobin::next(snapshot) → WorkerChannel::send_stream
//!     Supervisor spawns and respawns worker processes
//!
//! Worker:
//!     HandleReceiver::recv_stream → Acceptor::adopt → session read loop
//! ```

pub mod backoff;
pub mod channel;
pub mod listener;
pub mod registry;
pub mod round_robin;
pub mod supervisor;

use std::sync::Arc;

use crate::config::Role;

pub use channel::{HandleReceiver, HandoffError, WorkerChannel, WorkerHello};
pub use listener::ClusterListener;
pub use registry::{WorkerEntry, WorkerId, WorkerRegistry};
pub use round_robin::{DispatchError, RoundRobin};
pub use supervisor::Supervisor;

/// This process's place in the cluster.
#[derive(Clone)]
pub struct ClusterView {
    role: Role,
    registry: Arc<WorkerRegistry>,
}

impl ClusterView {
    pub fn new(role: Role, registry: Arc<WorkerRegistry>) -> Self {
        Self { role, registry }
    }

    pub fn standalone() -> Self {
        Self::new(Role::Standalone, Arc::new(WorkerRegistry::new()))
    }

    pub fn worker() -> Self {
        Self::new(Role::Worker, Arc::new(WorkerRegistry::new()))
    }

    pub fn master(registry: Arc<WorkerRegistry>) -> Self {
        Self::new(Role::Master, registry)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Fresh snapshot of live workers.
    pub fn workers(&self) -> Arc<Vec<Arc<WorkerEntry>>> {
        self.registry.snapshot()
    }

    pub(crate) fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}
