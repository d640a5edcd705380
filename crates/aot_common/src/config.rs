use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Location where graph dumps and metadata reports are written.
#[derive(Clone, Debug)]
pub struct ArtifactDir {
    pub dir_path: PathBuf,
    pub filename_prefix: PathBuf,
}

impl ArtifactDir {
    pub fn create(
        dir_path: impl Into<PathBuf>,
        filename_prefix: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let dir_path = dir_path.into();
        fs::create_dir_all(&dir_path)?;
        Ok(ArtifactDir {
            dir_path,
            filename_prefix: filename_prefix.into(),
        })
    }

    pub fn artifact_path(&self, extension: &(impl AsRef<OsStr> + ?Sized)) -> PathBuf {
        self.dir_path
            .join(self.filename_prefix.with_extension(extension))
    }

    /// Artifacts for a nested compilation (e.g. one graph out of several produced for a single
    /// function) share the directory but get their own filename prefix.
    pub fn nested(&self, name: &str) -> ArtifactDir {
        let mut prefix = self.filename_prefix.clone().into_os_string();
        prefix.push("-");
        prefix.push(name);
        ArtifactDir {
            dir_path: self.dir_path.clone(),
            filename_prefix: prefix.into(),
        }
    }
}
