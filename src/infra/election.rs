//! Mastership signal shims.
//!
//! Real deployments plug in an etcd-style election; the storage core only
//! consumes the boolean signal.

use async_trait::async_trait;

use crate::domain::TreeId;

use super::MasterSignal;

/// A stub signal that always believes it is the master.
///
/// Suitable for single-instance deployments and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMaster;

#[async_trait]
impl MasterSignal for NoopMaster {
    async fn is_master(&self, _tree_id: TreeId) -> bool {
        true
    }

    async fn await_master(&self, _tree_id: TreeId) {}
}
