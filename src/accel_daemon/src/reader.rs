use log::error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Spawn the per-connection line reader task. Lines have no length
/// limit; each is delivered without its trailing newline. The channel
/// closes on EOF or transport failure, which is how the dispatcher
/// learns the connection is gone. The task runs detached so a blocked
/// read never stalls the dispatcher.
pub(crate) fn spawn_line_reader<R>(read_half: R) -> mpsc::Receiver<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => return,
                Ok(_) => {
                    if line.last() == Some(&b'\n') {
                        line.pop();
                        if line.last() == Some(&b'\r') {
                            line.pop();
                        }
                    }
                    if tx.send(line.clone()).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    error!("connection read failed: {}", err);
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reads_lines_without_newline() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut lines = spawn_line_reader(server);

        client.write_all(b"one\ntwo\r\n\nthree").await.unwrap();
        drop(client);

        assert_eq!(lines.recv().await.unwrap(), b"one");
        assert_eq!(lines.recv().await.unwrap(), b"two");
        assert_eq!(lines.recv().await.unwrap(), b"");
        // Final partial line before EOF is still delivered.
        assert_eq!(lines.recv().await.unwrap(), b"three");
        assert!(lines.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_line_longer_than_buffer() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut lines = spawn_line_reader(server);

        let long = vec![b'x'; 64 * 1024];
        let writer = tokio::spawn(async move {
            client.write_all(&long).await.unwrap();
            client.write_all(b"\n").await.unwrap();
            drop(client);
        });

        let line = lines.recv().await.unwrap();
        assert_eq!(line.len(), 64 * 1024);
        assert!(line.iter().all(|b| *b == b'x'));
        assert!(lines.recv().await.is_none());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_closes_on_eof() {
        let (client, server) = tokio::io::duplex(64);
        let mut lines = spawn_line_reader(server);
        drop(client);
        assert!(lines.recv().await.is_none());
    }
}
