//! Output sinks for materialized files.
//!
//! The completion tracker hands every finished file to an [`OutputSink`].
//! [`DirectorySink`] writes files below a root directory:
//!
//! ```text
//! <root>/<udid>/<domain>/<relative path>    (default)
//! <root>/<relative path>                    (flat)
//! ```
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! partially written file never appears under its final name.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::agent::BoxFuture;
use crate::config::OutputConfig;
use crate::model::FileRecord;

/// Suffix of the temporary file written before the final rename.
const TEMP_SUFFIX: &str = ".snapfetch-tmp";

/// Destination for materialized file contents.
pub trait OutputSink: Send + Sync + 'static {
    /// Persist the full plaintext of `file`.
    fn write<'a>(&'a self, file: &'a FileRecord, data: Bytes) -> BoxFuture<'a, io::Result<()>>;
}

/// Writes files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    udid: String,
    flat: bool,
    set_last_modified: bool,
    force_overwrite: bool,
}

impl DirectorySink {
    /// Sink writing the files of backup `udid` below `root`.
    pub fn new(root: impl Into<PathBuf>, udid: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            udid: udid.into(),
            flat: false,
            set_last_modified: true,
            force_overwrite: false,
        }
    }

    /// Sink configured from the `[output]` section.
    pub fn from_config(config: &OutputConfig, udid: impl Into<String>) -> Self {
        Self::new(&config.directory, udid)
            .with_flat(config.flat)
            .with_set_last_modified(config.set_last_modified)
            .with_force_overwrite(config.force_overwrite)
    }

    /// Drop the udid and domain levels from output paths.
    pub fn with_flat(mut self, flat: bool) -> Self {
        self.flat = flat;
        self
    }

    pub fn with_set_last_modified(mut self, enabled: bool) -> Self {
        self.set_last_modified = enabled;
        self
    }

    /// Rewrite files that already exist with the expected size.
    pub fn with_force_overwrite(mut self, enabled: bool) -> Self {
        self.force_overwrite = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of `file`.
    ///
    /// Fails with `InvalidInput` if the domain or path would escape the root.
    pub fn path_for(&self, file: &FileRecord) -> io::Result<PathBuf> {
        let mut path = self.root.clone();
        if !self.flat {
            push_relative(&mut path, &self.udid)?;
            push_relative(&mut path, &file.domain)?;
        }
        push_relative(&mut path, &file.relative_path)?;
        if path == self.root {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("empty output path for {}", file),
            ));
        }
        Ok(path)
    }

    async fn write_file(&self, file: &FileRecord, data: Bytes) -> io::Result<()> {
        let path = self.path_for(file)?;

        if !self.force_overwrite {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() && meta.len() == data.len() as u64 {
                    debug!(path = %path.display(), "File exists, skipping");
                    return Ok(());
                }
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_path_for(&path);
        let mut out = tokio::fs::File::create(&temp_path).await?;
        out.write_all(&data).await?;
        out.flush().await?;
        out.sync_all().await?;
        let out = out.into_std().await;

        let modified = file.last_modified.filter(|_| self.set_last_modified);
        let mode = file.mode;
        tokio::task::spawn_blocking(move || {
            if let Some(modified) = modified {
                out.set_modified(SystemTime::from(modified))?;
            }
            apply_mode(&out, mode)
        })
        .await
        .map_err(io::Error::other)??;

        tokio::fs::rename(&temp_path, &path).await?;
        trace!(path = %path.display(), bytes = data.len(), "File written");
        Ok(())
    }
}

impl OutputSink for DirectorySink {
    fn write<'a>(&'a self, file: &'a FileRecord, data: Bytes) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(self.write_file(file, data))
    }
}

/// Append `relative` to `path`, accepting only plain components.
fn push_relative(path: &mut PathBuf, relative: &str) -> io::Result<()> {
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes output root: {}", relative),
                ));
            }
        }
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(unix)]
fn apply_mode(file: &std::fs::File, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        file.set_permissions(std::fs::Permissions::from_mode(mode & 0o777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_file: &std::fs::File, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}
