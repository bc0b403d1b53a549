use std::mem;
use std::os::unix::fs::PermissionsExt;
use std::time::Instant;

use log::{debug, error, warn};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::dir_tree::DirTree;
use crate::remove::concurrent_remove;
use crate::request::{normalize_path, FsRequest, Response};
use crate::spec_file::{FutureFile, DEFAULT_FILE_MODE};
use crate::{fatal, AccelError, AccelResult};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const MODE_MASK: u32 = 0o777;

/// Per-connection state. The dispatcher owns the session and drives it
/// strictly sequentially, so the speculative tree needs no locking; the
/// `finalized` latch makes finalize idempotent when both the
/// end-of-session sentinel and connection close fire.
pub struct Session {
    open_files: Vec<File>,
    finalized: bool,
    tree: DirTree,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            open_files: Vec::new(),
            finalized: false,
            tree: DirTree::new_root(),
        }
    }

    /// Decode one request line, run the selected operation, and map
    /// the outcome onto the response value. Handler errors are logged
    /// and folded into the response; they never end the session.
    pub async fn handle_request(&mut self, input: &[u8]) -> Response {
        let started = Instant::now();

        let request: FsRequest = match serde_json::from_slice(input) {
            Ok(request) => request,
            Err(err) => {
                warn!("request decode failed: {}", err);
                return Response::Invalid;
            }
        };

        let dest = match normalize_path(&request.dest) {
            Ok(path) => path,
            Err(err) => {
                warn!("invalid dest path: {}", err);
                return Response::Invalid;
            }
        };

        let response = if let Some(src) = &request.src {
            let src = match normalize_path(src) {
                Ok(path) => path,
                Err(err) => {
                    warn!("invalid src path: {}", err);
                    return Response::Invalid;
                }
            };
            match self.copy_file(&src, &dest, request.perm).await {
                Ok(()) => Response::True,
                Err(err) => {
                    error!("copy {} -> {} failed: {}", src, dest, err);
                    Response::False
                }
            }
        } else if let Some(content) = &request.content_b64 {
            match self.create_file(&content.0, &dest, request.perm).await {
                Ok(()) => Response::True,
                Err(err) => {
                    error!("create {} failed: {}", dest, err);
                    Response::False
                }
            }
        } else if request.speculate {
            // The hint is advisory: the client gets `true` either way
            // and a failed open surfaces when a real write arrives.
            if let Err(err) = self.speculate_file(&dest, request.perm).await {
                error!("speculate {} failed: {}", dest, err);
            }
            Response::True
        } else if request.existence {
            Response::from_bool(self.existence(&dest).await)
        } else if request.mkdir {
            match self.make_dir(&dest, request.perm).await {
                Ok(()) => Response::True,
                Err(err) => {
                    error!("mkdir {} failed: {}", dest, err);
                    Response::False
                }
            }
        } else if request.listdir {
            match self.list_dir(&dest).await {
                Ok(names) => Response::Names(names),
                Err(err) => {
                    error!("listdir {} failed: {}", dest, err);
                    Response::Names(Vec::new())
                }
            }
        } else if request.delete {
            match self.delete(&dest, false).await {
                Ok(deleted) => Response::from_bool(deleted),
                Err(err) => {
                    error!("delete {} failed: {}", dest, err);
                    Response::False
                }
            }
        } else if request.delete_recursive {
            match self.delete(&dest, true).await {
                Ok(deleted) => Response::from_bool(deleted),
                Err(err) => {
                    error!("delete_recursive {} failed: {}", dest, err);
                    Response::False
                }
            }
        } else {
            warn!("request selects no operation: {}", dest);
            Response::Invalid
        };

        debug!("request for {} handled in {:?}", dest, started.elapsed());
        response
    }

    pub async fn speculate_file(&mut self, dest: &str, perm: Option<u32>) -> AccelResult<()> {
        if dest == "/" {
            return Err(AccelError::AlreadyExists(format!(
                "directory already exists: {}",
                dest
            )));
        }
        self.tree.add_file(&split_abs(dest), perm).await
    }

    pub async fn existence(&mut self, dest: &str) -> bool {
        if let Some(fut) = self.find_spec_file(dest).await {
            return !fut.is_new;
        }
        if dest == "/" {
            return !self.tree.speculative;
        }
        if let Some(node) = self.tree.find_dir(&split_abs(dest)) {
            return !node.speculative;
        }
        match fs::metadata(dest).await {
            Ok(_) => true,
            Err(err) => err.kind() != std::io::ErrorKind::NotFound,
        }
    }

    pub async fn make_dir(&mut self, dest: &str, perm: Option<u32>) -> AccelResult<()> {
        if dest == "/" {
            return Err(AccelError::AlreadyExists(format!(
                "cannot mkdir directory: already exists: {}",
                dest
            )));
        }
        self.tree.make_dir(&split_abs(dest), perm).await
    }

    pub async fn list_dir(&mut self, dest: &str) -> AccelResult<Vec<String>> {
        let node = if dest == "/" {
            Some(&mut self.tree)
        } else {
            self.tree.find_dir_mut(&split_abs(dest))
        };
        if let Some(node) = node {
            return node.logical_list().await;
        }

        let mut read_dir = fs::read_dir(dest).await?;
        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    pub async fn delete(&mut self, dest: &str, recursive: bool) -> AccelResult<bool> {
        if let Some(fut) = self.find_spec_file(dest).await {
            if fut.is_new {
                // The speculation conjured this file; there is nothing
                // real to delete.
                return Ok(false);
            }
            fut.is_new = true;
            return Ok(true);
        }

        let node = if dest == "/" {
            Some(&mut self.tree)
        } else {
            self.tree.find_dir_mut(&split_abs(dest))
        };
        if let Some(node) = node {
            return node.delete(recursive).await;
        }

        match fs::metadata(dest).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        concurrent_remove(dest.to_string(), recursive).await?;
        Ok(true)
    }

    pub async fn copy_file(
        &mut self,
        src: &str,
        dest: &str,
        perm: Option<u32>,
    ) -> AccelResult<()> {
        let mut src_file = File::open(src).await?;
        let mut dest_file = self.create_dest(dest, perm).await?;
        let dest_old_len = dest_file.metadata().await?.len();

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;
        let mut copy_result: AccelResult<()> = Ok(());
        loop {
            let read = match src_file.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    copy_result = Err(err.into());
                    break;
                }
            };
            if read == 0 {
                break;
            }
            if let Err(err) = dest_file.write_all(&buf[..read]).await {
                copy_result = Err(err.into());
                break;
            }
            written += read as u64;
        }

        // Whatever happened above, an old longer destination must not
        // keep a stale tail past the bytes actually written.
        truncate_dest(&dest_file, dest, dest_old_len, written).await;

        copy_result?;
        self.open_files.push(src_file);
        self.open_files.push(dest_file);
        Ok(())
    }

    pub async fn create_file(
        &mut self,
        content: &[u8],
        dest: &str,
        perm: Option<u32>,
    ) -> AccelResult<()> {
        let mut dest_file = self.create_dest(dest, perm).await?;
        let dest_old_len = dest_file.metadata().await?.len();

        dest_file.write_all(content).await?;
        truncate_dest(&dest_file, dest, dest_old_len, content.len() as u64).await;

        self.open_files.push(dest_file);
        Ok(())
    }

    /// Obtain the destination handle for a real write: a pending
    /// speculation is consumed if one exists, otherwise the file is
    /// opened (and created) right here. Either way the requested mode
    /// is enforced now, using the open-time snapshot to skip a chmod
    /// that would be a no-op.
    async fn create_dest(&mut self, dest: &str, perm: Option<u32>) -> AccelResult<File> {
        let requested = perm.map(|p| p & MODE_MASK);

        if dest != "/" {
            if let Some(fut) = self.tree.consume_file(&split_abs(dest)).await {
                debug!("speculative file found at: {}", dest);
                let FutureFile {
                    perm: observed,
                    handle,
                    ..
                } = fut;
                let file = handle?;
                if let Some(want) = requested {
                    if observed != want {
                        file.set_permissions(std::fs::Permissions::from_mode(want))
                            .await?;
                    }
                }
                return Ok(file);
            }
        }

        debug!("speculative file not found at: {}", dest);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(requested.unwrap_or(DEFAULT_FILE_MODE))
            .open(dest)
            .await?;
        if let Some(want) = requested {
            let observed = file.metadata().await?.permissions().mode() & MODE_MASK;
            if observed != want {
                file.set_permissions(std::fs::Permissions::from_mode(want))
                    .await?;
            }
        }
        Ok(file)
    }

    async fn find_spec_file(&mut self, dest: &str) -> Option<&mut FutureFile> {
        let (parent_parts, name) = split_parent(dest)?;
        let node = if parent_parts.is_empty() {
            &mut self.tree
        } else {
            self.tree.find_dir_mut(&parent_parts)?
        };
        let file = node.child_files.get_mut(&name)?;
        Some(file.future_file().await)
    }

    /// Idempotent session teardown: drop every retained handle in one
    /// sweep, then roll back whatever the speculative tree still holds.
    /// Cleanup errors are logged and swallowed.
    pub async fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let started = Instant::now();
        self.open_files.clear();

        let tree = mem::replace(&mut self.tree, DirTree::new_root());
        if let Err(err) = tree.clean().await {
            error!("session cleanup failed: {}", err);
        }
        debug!("finalize took {:?}", started.elapsed());
    }
}

/// Split an absolute path into its segments. Callers normalize first,
/// so a relative or root path here takes the whole process down.
fn split_abs(path: &str) -> Vec<String> {
    if !path.starts_with('/') {
        fatal(format!("path must be absolute: {}", path));
    }
    if path.len() < 2 {
        fatal(format!("path must not be the root: {}", path));
    }
    path[1..].split('/').map(|s| s.to_string()).collect()
}

/// Split into (parent segments, file name); None for the root.
fn split_parent(path: &str) -> Option<(Vec<String>, String)> {
    if path == "/" {
        return None;
    }
    let mut parts = split_abs(path);
    let name = parts.pop()?;
    Some((parts, name))
}

async fn truncate_dest(dest_file: &File, dest: &str, old_len: u64, written: u64) {
    if old_len <= written {
        debug!(
            "truncation omitted for {}: old: {} bytes, new: {} bytes",
            dest, old_len, written
        );
        return;
    }
    if let Err(err) = dest_file.set_len(written).await {
        warn!("truncate {} to {} bytes failed: {}", dest, written, err);
    }
}
