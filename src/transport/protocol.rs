//! Wire protocol between the coordinator and its workers: newline-delimited
//! JSON messages over a TCP stream, one request/response pair per exchange.

use super::TransportError;
use crate::analyzer::BatchResult;
use crate::chunker::Batch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Messages a worker sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    Register {
        worker: String,
    },
    RequestWork {
        worker: String,
    },
    SubmitResult {
        worker: String,
        unit_id: u64,
        attempt: u32,
        outcome: SubmitOutcome,
    },
    Heartbeat {
        worker: String,
    },
}

/// Explicit success/failure tagging on SUBMIT_RESULT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Success { result: BatchResult },
    Failure { reason: String },
}

/// Messages the coordinator sends back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorMessage {
    Registered {
        worker: String,
    },
    CapacityExceeded,
    NoWork {
        /// True once the run has drained; the worker can exit instead of
        /// backing off and retrying.
        run_complete: bool,
    },
    WorkUnit {
        unit_id: u64,
        attempt: u32,
        batch: Batch,
    },
    Ack,
    Nack {
        reason: String,
    },
}

pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. Ok(None) means the peer closed the connection.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    T: DeserializeOwned,
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}
