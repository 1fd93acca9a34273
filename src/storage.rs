use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// File storage scoped to a single root directory. Every name handed out by the protocol resolves
/// to a direct child of the root.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Opens the storage root, creating it if it doesn't exist yet.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Storage> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Storage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a protocol file name to a path under the root, refusing anything that could escape it.
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\', '\0'])
        {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("'{name}' is not a valid file name"),
            ));
        }
        Ok(self.root.join(name))
    }

    /// Opens a stored file for reading. Only regular files count, anything else is `NotFound`.
    pub fn open_read(&self, name: &str) -> io::Result<File> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("'{name}' not found")));
        }
        File::open(path)
    }

    /// Creates a file that must not exist yet. Fails with `AlreadyExists` otherwise.
    pub fn create_new(&self, name: &str) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(name)?)
    }

    pub fn delete(&self, name: &str) -> io::Result<()> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("'{name}' not found")));
        }
        fs::remove_file(path)
    }

    /// Names of the regular files currently in the root, sorted.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => log::warn!("Skipping non UTF-8 file name {:?}", raw),
            }
        }
        names.sort();
        Ok(names)
    }
}
