use std::path::PathBuf;

use accel_session::{AccelError, AccelResult, Session};
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Runtime;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::reader::spawn_line_reader;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub socket_path: PathBuf,
    pub debug: bool,
    pub panic_on_exit: bool,
}

pub fn run_daemon(options: RunOptions) -> AccelResult<()> {
    let runtime = Runtime::new().map_err(|err| AccelError::Internal(err.to_string()))?;
    runtime.block_on(serve(options))
}

async fn serve(options: RunOptions) -> AccelResult<()> {
    // A stale socket file from a previous run would make bind fail.
    let _ = tokio::fs::remove_file(&options.socket_path).await;

    let listener = UnixListener::bind(&options.socket_path).map_err(|err| {
        AccelError::IoError(format!(
            "bind {} failed: {}",
            options.socket_path.display(),
            err
        ))
    })?;
    info!("listening on {}", options.socket_path.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let shutdown = shutdown_rx.clone();
                        connections.spawn(handle_connection(stream, shutdown));
                    }
                    Err(err) => error!("accept failed: {}", err),
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, draining sessions");
                break;
            }
        }
    }

    drop(listener);
    let _ = shutdown_tx.send(true);
    while let Some(joined) = connections.join_next().await {
        if let Err(err) = joined {
            error!("connection task panicked: {}", err);
        }
    }
    let _ = tokio::fs::remove_file(&options.socket_path).await;
    info!("all sessions finalized, exiting");
    Ok(())
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!("install SIGTERM handler failed: {}", err);
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("wait for interrupt failed: {}", err);
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("wait for interrupt failed: {}", err);
            }
        }
        _ = term.recv() => {}
    }
}

/// One connection, one session. Requests are handled strictly in
/// order; the reader task keeps pulling bytes while the current
/// operation runs. Whatever ends the loop, the session is finalized
/// exactly once.
pub(crate) async fn handle_connection(stream: UnixStream, mut shutdown: watch::Receiver<bool>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = spawn_line_reader(read_half);
    let mut session = Session::new();

    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = shutdown.changed() => {
                debug!("connection cancelled by shutdown");
                break;
            }
        };
        let Some(line) = line else {
            // EOF or transport failure; the reader closed the channel.
            break;
        };

        if line.is_empty() {
            session.finalize().await;
            write_response(&mut write_half, "true").await;
            break;
        }

        let response = session.handle_request(&line).await;
        write_response(&mut write_half, &response.encode()).await;
    }

    session.finalize().await;
}

async fn write_response(write_half: &mut OwnedWriteHalf, value: &str) {
    let mut line = String::with_capacity(value.len() + 1);
    line.push_str(value);
    line.push('\n');
    if let Err(err) = write_half.write_all(line.as_bytes()).await {
        // The next read will notice the dead transport and end the
        // session.
        warn!("write response failed: {}", err);
    }
}
