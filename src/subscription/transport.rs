//! How shell data reaches a client

use super::error::SubscriptionResult;
use super::types::{CallbackReason, ShellData};
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Receiver of shell data for callback clients
#[async_trait]
pub trait SubscriptionCallback: Send + Sync {
    async fn on_data(
        &self,
        subscription_id: &str,
        data: ShellData,
        reason: CallbackReason,
    ) -> SubscriptionResult<()>;
}

/// Source of pulled atoms
#[async_trait]
pub trait PullSource: Send + Sync {
    /// Pulls the current values of `atom_id`, optionally restricted to `packages`
    async fn pull(
        &self,
        atom_id: i32,
        packages: &[String],
    ) -> SubscriptionResult<Vec<crate::event::LogEvent>>;
}

pub enum ShellTransport {
    /// Length-prefixed JSON frames written to a byte stream
    Pipe(Box<dyn AsyncWrite + Send + Unpin>),
    Callback(std::sync::Arc<dyn SubscriptionCallback>),
}

impl std::fmt::Debug for ShellTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellTransport::Pipe(_) => f.write_str("Pipe"),
            ShellTransport::Callback(_) => f.write_str("Callback"),
        }
    }
}

impl ShellTransport {
    pub fn is_callback(&self) -> bool {
        matches!(self, ShellTransport::Callback(_))
    }

    pub(crate) async fn send(
        &mut self,
        subscription_id: &str,
        data: ShellData,
        reason: CallbackReason,
    ) -> SubscriptionResult<()> {
        match self {
            ShellTransport::Pipe(writer) => write_frame(writer, Some(&data)).await,
            ShellTransport::Callback(callback) => {
                callback.on_data(subscription_id, data, reason).await
            }
        }
    }

    pub(crate) async fn heartbeat(&mut self) -> SubscriptionResult<()> {
        match self {
            ShellTransport::Pipe(writer) => write_frame(writer, None).await,
            ShellTransport::Callback(_) => Ok(()),
        }
    }
}

/// Writes one frame: a little-endian u32 length followed by the JSON payload.
/// `None` writes a zero-length heartbeat frame.
pub async fn write_frame<W>(writer: &mut W, data: Option<&ShellData>) -> SubscriptionResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = match data {
        Some(data) => serde_json::to_vec(data)?,
        None => Vec::new(),
    };
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "shell frame too large")
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame written by [`write_frame`]; `Ok(None)` is a heartbeat
pub async fn read_frame<R>(reader: &mut R) -> SubscriptionResult<Option<ShellData>>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
{
    use tokio::io::AsyncReadExt;

    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogEvent;

    #[tokio::test]
    async fn test_frames_and_heartbeat() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut data = ShellData::default();
        data.push(LogEvent::new(10, 42));

        write_frame(&mut server, None).await.unwrap();
        write_frame(&mut server, Some(&data)).await.unwrap();

        assert_eq!(read_frame(&mut client).await.unwrap(), None);
        let received = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(received.elapsed_timestamp_nanos, vec![42]);
        assert_eq!(received.atoms[0].atom_id, 10);
    }
}
