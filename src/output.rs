use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle for queueing protocol lines towards the mail agent.
///
/// Lines are bytes: replayed message content is passed through untouched,
/// whatever its encoding. Every producer (control loop, scan tasks, commit waiters) shares one FIFO,
/// so lines are never interleaved and a line queued after another is written
/// after it.
#[derive(Debug, Clone)]
pub struct Output {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Output {
    /// An output whose lines are collected from the returned receiver.
    pub fn channel() -> (Output, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Output { tx }, rx)
    }

    pub fn send(&self, line: impl Into<Vec<u8>>) {
        if let Err(e) = self.tx.send(line.into()) {
            log::error!(
                "Output writer has stopped, dropping line: {:?}",
                String::from_utf8_lossy(&e.0)
            );
        }
    }
}

/// Spawn the task owning `writer`. The task ends once every [`Output`]
/// clone has been dropped and the queue is drained.
pub fn spawn_writer<W>(writer: W) -> (Output, JoinHandle<std::io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (output, rx) = Output::channel();
    let handle = tokio::spawn(write_lines(rx, writer));
    (output, handle)
}

async fn write_lines<W>(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    writer: W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(line) = rx.recv().await {
        write_line(&mut writer, &line).await?;
        // batch whatever is already queued before flushing
        while let Ok(line) = rx.try_recv() {
            write_line(&mut writer, &line).await?;
        }
        writer.flush().await?;
    }

    writer.flush().await
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &[u8]) -> std::io::Result<()> {
    writer.write_all(line).await?;
    writer.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (output, handle) = spawn_writer(client);

        output.send("register|ready");
        let clone = output.clone();
        clone.send(b"filter-dataline|t1|s1|caf\xe9".to_vec());
        clone.send("filter-result|t1|s1|proceed".to_string());
        drop(output);
        drop(clone);

        handle.await.unwrap().unwrap();

        let mut written = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut written)
            .await
            .unwrap();
        assert_eq!(
            written,
            b"register|ready\nfilter-dataline|t1|s1|caf\xe9\nfilter-result|t1|s1|proceed\n"
        );
    }
}
