use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::fs;

use crate::{AccelError, AccelResult};

/// Remove a path, fanning subtree removals out over the runtime's
/// worker pool. A plain file (or an empty directory in non-recursive
/// mode) is a single unlink; a directory in recursive mode removes its
/// children in parallel, joins them, and surfaces the first error.
pub fn concurrent_remove(path: String, recursive: bool) -> BoxFuture<'static, AccelResult<()>> {
    async move {
        let meta = fs::metadata(&path).await?;
        if !meta.is_dir() {
            fs::remove_file(&path).await?;
            return Ok(());
        }
        if !recursive {
            fs::remove_dir(&path).await?;
            return Ok(());
        }

        let mut read_dir = fs::read_dir(&path).await?;
        let mut handles = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let child = format!("{}/{}", path, entry.file_name().to_string_lossy());
            handles.push(tokio::spawn(concurrent_remove(child, true)));
        }
        for joined in join_all(handles).await {
            joined.map_err(|err| AccelError::Internal(format!("remove task failed: {}", err)))??;
        }

        fs::remove_dir(&path).await?;
        Ok(())
    }
    .boxed()
}
