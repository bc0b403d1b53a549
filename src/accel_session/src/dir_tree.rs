use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use log::debug;
use tokio::fs;

use crate::remove::concurrent_remove;
use crate::spec_file::{FutureFile, SpecFile};
use crate::{fatal, AccelError, AccelResult};

const DIR_MODE: u32 = 0o755;
const MODE_MASK: u32 = 0o777;

/// One directory in the speculative tree. The tree mirrors a prefix of
/// the on-disk tree: once a node is fully constructed, the directory at
/// its path exists on disk. `speculative` means the engine conjured the
/// directory for a speculation and may roll it back at cleanup; it
/// flips to false on any real mkdir or consumed write underneath and
/// never flips back.
pub struct DirTree {
    /// Absolute path without a trailing slash; the root stores "". The
    /// final segment doubles as the node's name, which is also its key
    /// in the parent's map.
    pub(crate) path: String,
    pub(crate) child_dirs: HashMap<String, DirTree>,
    pub(crate) child_files: HashMap<String, SpecFile>,
    pub(crate) speculative: bool,
}

impl DirTree {
    pub fn new_root() -> Self {
        Self {
            path: String::new(),
            child_dirs: HashMap::new(),
            child_files: HashMap::new(),
            speculative: false,
        }
    }

    fn new_child(parent_path: &str, name: &str, speculative: bool) -> Self {
        Self {
            path: format!("{}/{}", parent_path, name),
            child_dirs: HashMap::new(),
            child_files: HashMap::new(),
            speculative,
        }
    }

    pub(crate) fn disk_path(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }

    /// Ensure a node for `name` under this one, creating the on-disk
    /// directory when it is missing. A pre-existing directory yields a
    /// non-speculative node regardless of `speculative`; a pre-existing
    /// non-directory is an error.
    async fn materialize_child(
        parent_path: &str,
        name: &str,
        speculative: bool,
    ) -> AccelResult<DirTree> {
        let path = format!("{}/{}", parent_path, name);
        match fs::metadata(&path).await {
            Err(_) => {
                fs::DirBuilder::new().mode(DIR_MODE).create(&path).await?;
                Ok(DirTree::new_child(parent_path, name, speculative))
            }
            Ok(meta) if meta.is_dir() => Ok(DirTree::new_child(parent_path, name, false)),
            Ok(_) => Err(AccelError::AlreadyExists(format!(
                "cannot create directory: file already exists: {}",
                path
            ))),
        }
    }

    /// Walk to the parent of the leaf, materializing missing interior
    /// directories as speculative, then start (or reuse) the background
    /// open for the leaf file.
    pub async fn add_file(&mut self, parts: &[String], perm: Option<u32>) -> AccelResult<()> {
        if parts.is_empty() {
            fatal("add_file: path segments must not be empty".to_string());
        }

        let mut node = self;
        for part in &parts[..parts.len() - 1] {
            if !node.child_dirs.contains_key(part) {
                let child = DirTree::materialize_child(&node.path, part, true).await?;
                node.child_dirs.insert(part.clone(), child);
            }
            node = node
                .child_dirs
                .get_mut(part)
                .expect("child directory was just ensured");
        }

        let name = &parts[parts.len() - 1];
        if !node.child_files.contains_key(name) {
            let path = format!("{}/{}", node.path, name);
            node.child_files
                .insert(name.clone(), SpecFile::spawn(path, perm));
        }
        Ok(())
    }

    /// Real mkdir. Descending never crosses a pending speculation it
    /// did not create; a speculative target is promoted to real instead
    /// of failing, which is how a prior speculation's directory becomes
    /// a legitimate mkdir result.
    pub async fn make_dir(&mut self, parts: &[String], perm: Option<u32>) -> AccelResult<()> {
        if parts.is_empty() {
            fatal("make_dir: path segments must not be empty".to_string());
        }

        let mut node = self;
        let mut idx = 0;
        loop {
            if node.speculative {
                return Err(AccelError::NotFound(
                    "parent directory doesn't exist".to_string(),
                ));
            }

            let part = &parts[idx];
            if !node.child_dirs.contains_key(part) {
                return make_dir_tail(&node.path, &parts[idx..], perm).await;
            }
            let child = node
                .child_dirs
                .get_mut(part)
                .expect("child directory presence was just checked");

            if idx == parts.len() - 1 {
                if child.speculative {
                    child.speculative = false;
                    return Ok(());
                }
                return Err(AccelError::AlreadyExists(format!(
                    "directory already exists: {}",
                    child.disk_path()
                )));
            }

            node = child;
            idx += 1;
        }
    }

    pub fn find_dir(&self, parts: &[String]) -> Option<&DirTree> {
        let mut node = self;
        for part in parts {
            node = node.child_dirs.get(part)?;
        }
        Some(node)
    }

    pub fn find_dir_mut(&mut self, parts: &[String]) -> Option<&mut DirTree> {
        let mut node = self;
        for part in parts {
            node = node.child_dirs.get_mut(part)?;
        }
        Some(node)
    }

    /// Take the speculative file at the given path, if any, resolving
    /// its background open. Every node the walk descended through is
    /// materialized: a real write is landing underneath it.
    pub fn consume_file<'a>(
        &'a mut self,
        parts: &'a [String],
    ) -> BoxFuture<'a, Option<FutureFile>> {
        async move {
            if parts.is_empty() {
                fatal("consume_file: path segments must not be empty".to_string());
            }

            if parts.len() == 1 {
                let file = self.child_files.remove(&parts[0])?;
                let fut = file.take_future_file().await;
                self.speculative = false;
                return Some(fut);
            }

            let dir = self.child_dirs.get_mut(&parts[0])?;
            let fut = dir.consume_file(&parts[1..]).await;
            self.speculative = false;
            fut
        }
        .boxed()
    }

    /// Directory listing as the client should see it: on-disk names
    /// minus entries that exist only because of a pending speculation.
    pub async fn logical_list(&mut self) -> AccelResult<Vec<String>> {
        let mut read_dir = fs::read_dir(self.disk_path()).await?;
        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            if let Some(dir) = self.child_dirs.get(&name) {
                if dir.speculative {
                    continue;
                }
                entries.push(name);
                continue;
            }
            if let Some(file) = self.child_files.get_mut(&name) {
                if file.future_file().await.is_new {
                    continue;
                }
                entries.push(name);
                continue;
            }
            entries.push(name);
        }
        Ok(entries)
    }

    /// Logical delete of this directory. The node stays in the tree;
    /// marking it speculative makes cleanup remove the on-disk
    /// directory once the remaining speculative leftovers are gone.
    pub fn delete(&mut self, recursive: bool) -> BoxFuture<'_, AccelResult<bool>> {
        async move {
            if self.speculative {
                return Ok(false);
            }

            let names = self.logical_list().await?;
            if names.is_empty() {
                self.speculative = true;
                return Ok(true);
            }
            if !recursive {
                return Err(AccelError::NotEmpty(self.disk_path().to_string()));
            }

            let mut unmanaged = Vec::new();
            for name in names {
                if let Some(dir) = self.child_dirs.get_mut(&name) {
                    if !dir.delete(true).await? {
                        return Err(AccelError::InvalidState(format!(
                            "failed to delete: {}",
                            dir.disk_path()
                        )));
                    }
                    continue;
                }
                if let Some(file) = self.child_files.get_mut(&name) {
                    // Marking the speculation as engine-created makes
                    // cleanup unlink the on-disk file.
                    file.future_file().await.is_new = true;
                    continue;
                }
                unmanaged.push(format!("{}/{}", self.path, name));
            }

            let handles: Vec<_> = unmanaged
                .into_iter()
                .map(|path| tokio::spawn(concurrent_remove(path, true)))
                .collect();
            for joined in join_all(handles).await {
                joined
                    .map_err(|err| AccelError::Internal(format!("remove task failed: {}", err)))??;
            }

            self.speculative = true;
            Ok(true)
        }
        .boxed()
    }

    /// Session-end cleanup. Child files and subtrees are processed in
    /// parallel and joined before this node decides its own fate: a
    /// speculative directory is removed only when nothing real is left
    /// inside it.
    pub fn clean(self) -> BoxFuture<'static, AccelResult<()>> {
        async move {
            let DirTree {
                path,
                speculative,
                child_dirs,
                child_files,
            } = self;

            let mut handles = Vec::new();
            for (_, file) in child_files {
                handles.push(tokio::spawn(file.dispose_unused()));
            }
            for (_, dir) in child_dirs {
                handles.push(tokio::spawn(dir.clean()));
            }
            for joined in join_all(handles).await {
                joined
                    .map_err(|err| AccelError::Internal(format!("clean task failed: {}", err)))??;
            }

            if !speculative {
                return Ok(());
            }

            let disk_path = if path.is_empty() { "/" } else { path.as_str() };
            let mut read_dir = match fs::read_dir(disk_path).await {
                Ok(rd) => rd,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if read_dir.next_entry().await?.is_none() {
                debug!("removing unused speculative directory: {}", disk_path);
                fs::remove_dir(disk_path).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// Create the remaining on-disk tail of a mkdir below the deepest node
/// the tree knows about: 0755 intermediates, the requested mode (or
/// 0755) for the leaf. The leaf must not already exist.
async fn make_dir_tail(parent_path: &str, parts: &[String], perm: Option<u32>) -> AccelResult<()> {
    let mut path = parent_path.to_string();
    for part in &parts[..parts.len() - 1] {
        path = format!("{}/{}", path, part);
        match fs::DirBuilder::new().mode(DIR_MODE).create(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
    }

    let requested = perm.map(|p| p & MODE_MASK);
    let leaf_mode = requested.unwrap_or(DIR_MODE);
    path = format!("{}/{}", path, parts[parts.len() - 1]);
    fs::DirBuilder::new().mode(leaf_mode).create(&path).await?;

    if let Some(want) = requested {
        let observed = fs::metadata(&path).await?.permissions().mode() & MODE_MASK;
        if observed != want {
            fs::set_permissions(&path, std::fs::Permissions::from_mode(want)).await?;
        }
    }
    Ok(())
}
