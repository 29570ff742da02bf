use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "m4v", "flv", "wmv"];

/// Extension to store an upload under. Falls back to `mp4` for names that
/// do not end in a known video extension.
pub fn upload_extension(file_name: Option<&str>) -> &'static str {
    file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            let ext = ext.to_ascii_lowercase();
            VIDEO_EXTENSIONS.iter().copied().find(|known| *known == ext)
        })
        .unwrap_or("mp4")
}

/// Scratch directory for one run. Holds the upload, the synthesized
/// narration and the muxed output, and is removed when dropped.
pub struct Workspace {
    dir: TempDir,
    upload: PathBuf,
    narration: PathBuf,
    output: PathBuf,
}

impl Workspace {
    pub fn create(root: &Path, upload_extension: &str, narration_extension: &str) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("voiceover-").tempdir_in(root)?;
        debug!("Created workspace {}", dir.path().display());
        Ok(Self {
            upload: dir.path().join(format!("upload.{upload_extension}")),
            narration: dir.path().join(format!("narration.{narration_extension}")),
            output: dir.path().join("output.mp4"),
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn upload(&self) -> &Path {
        &self.upload
    }

    pub fn narration(&self) -> &Path {
        &self.narration
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Removes the directory and everything in it, reporting failures that
    /// a plain drop would swallow.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_owned();
        self.dir.close()?;
        debug!("Removed workspace {}", path.display());
        Ok(())
    }
}
