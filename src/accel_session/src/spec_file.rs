use std::os::unix::fs::PermissionsExt;

use log::{debug, error, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::sync::oneshot;

use crate::{AccelError, AccelResult};

pub const DEFAULT_FILE_MODE: u32 = 0o666;
const MODE_MASK: u32 = 0o777;

/// Resolved outcome of one background open. `perm` is the mode observed
/// on the handle after open, kept so later writes can skip redundant
/// chmod calls. `is_new` stays mutable after resolution: delete marks a
/// consumed-for-removal speculation by flipping it.
pub struct FutureFile {
    pub is_new: bool,
    pub perm: u32,
    pub handle: AccelResult<File>,
}

/// A file promised by a speculation hint. The open/create runs on a
/// detached task; the oneshot channel delivers exactly one FutureFile,
/// which is cached on first wait. Either a real write consumes the
/// record or cleanup disposes it.
pub struct SpecFile {
    path: String,
    pending: Option<oneshot::Receiver<FutureFile>>,
    resolved: Option<FutureFile>,
}

impl SpecFile {
    /// Start the background open for `path` and return the tracking
    /// record immediately.
    pub fn spawn(path: String, perm: Option<u32>) -> Self {
        let (tx, rx) = oneshot::channel();
        let open_path = path.clone();
        tokio::spawn(async move {
            let fut = open_dest(&open_path, perm).await;
            if tx.send(fut).is_err() {
                // Receiver dropped before the open resolved; the handle
                // inside the record closes with it.
                warn!("speculative open finished after session ended: {}", open_path);
            }
        });
        Self {
            path,
            pending: Some(rx),
            resolved: None,
        }
    }

    /// Wait for the background open (at most once) and return the
    /// cached record.
    pub async fn future_file(&mut self) -> &mut FutureFile {
        if self.resolved.is_none() {
            let fut = match self.pending.take() {
                Some(rx) => rx.await.unwrap_or_else(|_| FutureFile {
                    is_new: false,
                    perm: 0,
                    handle: Err(AccelError::Internal(
                        "speculative open task dropped its result".to_string(),
                    )),
                }),
                None => FutureFile {
                    is_new: false,
                    perm: 0,
                    handle: Err(AccelError::InvalidState(
                        "speculative file already taken".to_string(),
                    )),
                },
            };
            self.resolved = Some(fut);
        }
        self.resolved
            .as_mut()
            .expect("resolved record was just cached")
    }

    /// Resolve and take ownership of the record (consumption path).
    pub async fn take_future_file(mut self) -> FutureFile {
        self.future_file().await;
        self.resolved
            .take()
            .expect("resolved record was just cached")
    }

    /// Dispose a speculation that no real write claimed: unlink the
    /// file if the open created it, close the handle either way. Open
    /// errors are logged, not propagated, so cleanup keeps going.
    pub async fn dispose_unused(self) -> AccelResult<()> {
        let path = self.path.clone();
        let fut = self.take_future_file().await;
        match fut.handle {
            Err(err) => {
                error!("speculative open of {} had failed: {}", path, err);
                Ok(())
            }
            Ok(file) => {
                if fut.is_new {
                    fs::remove_file(&path).await?;
                }
                drop(file);
                Ok(())
            }
        }
    }
}

/// The background open itself. Try the pre-existing file first; only
/// create when that fails. A pre-existing file's mode is snapshotted
/// but never changed here: the speculation may be rolled back, and a
/// chmod would be a visible side effect. A freshly created file is
/// chmodded when the umask left its bits different from the request.
async fn open_dest(path: &str, perm: Option<u32>) -> FutureFile {
    if let Ok(file) = OpenOptions::new().write(true).open(path).await {
        let observed = observed_mode(&file).await;
        return FutureFile {
            is_new: false,
            perm: observed,
            handle: Ok(file),
        };
    }

    let requested = perm.map(|p| p & MODE_MASK);
    let create_mode = requested.unwrap_or(DEFAULT_FILE_MODE);
    match OpenOptions::new()
        .write(true)
        .create(true)
        .mode(create_mode)
        .open(path)
        .await
    {
        Ok(file) => {
            let mut observed = observed_mode(&file).await;
            if let Some(want) = requested {
                if observed != want {
                    match file
                        .set_permissions(std::fs::Permissions::from_mode(want))
                        .await
                    {
                        Ok(()) => observed = want,
                        Err(err) => warn!("chmod {:o} on {} failed: {}", want, path, err),
                    }
                }
            }
            debug!("speculative create finished: {} mode={:o}", path, observed);
            FutureFile {
                is_new: true,
                perm: observed,
                handle: Ok(file),
            }
        }
        Err(err) => FutureFile {
            is_new: false,
            perm: 0,
            handle: Err(err.into()),
        },
    }
}

async fn observed_mode(file: &File) -> u32 {
    file.metadata()
        .await
        .map(|meta| meta.permissions().mode() & MODE_MASK)
        .unwrap_or(0)
}
