//! Outbound side of a client connection.
//!
//! Each connection gets a writer task that drains an unbounded queue of
//! entities onto the socket. Anyone holding an [`Outbound`] can enqueue
//! without blocking; the task ends once every sender is gone or a write
//! fails, and then shuts the write half down.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use parley_shared::codec::write_entity;
use parley_shared::{Entity, InstanceId};

pub type Outbound = mpsc::UnboundedSender<Entity>;

/// How long a closing connection gets to flush its last entities.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub fn spawn_writer<W>(mut writer: W, instance: InstanceId) -> (Outbound, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Entity>();
    let task = tokio::spawn(async move {
        while let Some(entity) = rx.recv().await {
            if let Err(e) = write_entity(&mut writer, &entity).await {
                debug!(instance = %instance, error = %e, "Write failed, dropping connection");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    (tx, task)
}

/// Wait for the writer to flush, then force it closed.
///
/// Callers must drop their own [`Outbound`] clones first, or this always
/// runs into the grace timeout.
pub async fn finish_writer(task: JoinHandle<()>, instance: InstanceId) {
    let abort = task.abort_handle();
    if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
        debug!(instance = %instance, "Writer did not flush in time, aborting");
        abort.abort();
    }
}
