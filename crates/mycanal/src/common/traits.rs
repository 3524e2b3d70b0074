//! Service lifecycle for replication consumers

use crate::common::Result;
use async_trait::async_trait;

/// Background change capture that a host process starts once and stops on
/// shutdown.
///
/// [`crate::Canal`] implements it by spawning [`crate::Canal::run`]; the
/// lifecycle tests live next to that implementation.
#[async_trait]
pub trait CdcSource: Send + Sync {
    /// Spawn the replication task. Calling it while running is a no-op.
    async fn start(&mut self) -> Result<()>;

    /// Close the replication session and wait for the task to exit.
    async fn stop(&mut self) -> Result<()>;

    /// `true` while the replication task is alive.
    async fn is_healthy(&self) -> bool;
}
