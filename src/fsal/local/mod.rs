// Local Filesystem Backend
//
// Implements BackingStore over std::fs. Nodes are absolute paths below the
// export root; entries whose canonical location escapes the root are hidden.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use super::{BackingStore, FsalError, Result, StoreKind, WriteMode};

/// Local filesystem store
pub struct LocalStore {
    /// Canonical export root
    root_path: PathBuf,
}

impl LocalStore {
    /// Create a new local store
    ///
    /// # Arguments
    /// * `root_path` - Directory to export (e.g. "/srv/ftp")
    pub fn new<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path
            .as_ref()
            .canonicalize()
            .map_err(|e| FsalError::io(format!("canonicalize root {:?}", root_path.as_ref()), e))?;

        let metadata =
            fs::metadata(&root_path).map_err(|e| FsalError::io(format!("stat root {:?}", root_path), e))?;
        if !metadata.is_dir() {
            return Err(FsalError::NotADirectory(root_path.display().to_string()));
        }

        debug!("LocalStore created with root: {:?}", root_path);

        Ok(Self { root_path })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Reject names that could address anything but a direct child
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
            return Err(FsalError::InvalidPath(format!("invalid name: {:?}", name)));
        }
        Ok(())
    }

    /// Check that an existing path does not resolve outside the export root
    ///
    /// Symlinks may point anywhere; only those staying below the root are
    /// followed.
    fn within_root(&self, path: &Path) -> Result<bool> {
        let canonical = path
            .canonicalize()
            .map_err(|e| FsalError::io(format!("canonicalize {:?}", path), e))?;
        if canonical.starts_with(&self.root_path) {
            Ok(true)
        } else {
            warn!(
                "Path traversal attempt: {:?} resolves to {:?} outside root {:?}",
                path, canonical, self.root_path
            );
            Ok(false)
        }
    }

    fn metadata(&self, node: &Path) -> Option<fs::Metadata> {
        fs::metadata(node).ok()
    }
}

impl BackingStore for LocalStore {
    type Node = PathBuf;

    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    fn root(&self) -> PathBuf {
        self.root_path.clone()
    }

    /// Every virtual path is already rooted at the export, so there is no
    /// separate root marker
    fn root_sentinel(&self) -> &str {
        ""
    }

    fn is_random_access(&self) -> bool {
        true
    }

    fn supports_cross_parent_move(&self) -> bool {
        true
    }

    fn find_child(&self, dir: &PathBuf, name: &str) -> Result<Option<PathBuf>> {
        Self::validate_name(name)?;
        let path = dir.join(name);

        match fs::symlink_metadata(&path) {
            Ok(_) => {
                if self.within_root(&path).unwrap_or(false) {
                    Ok(Some(path))
                } else {
                    Err(FsalError::PermissionDenied(format!("{:?} is outside the export", path)))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FsalError::io(format!("stat {:?}", path), e)),
        }
    }

    fn parent(&self, node: &PathBuf) -> Option<PathBuf> {
        if node == &self.root_path {
            return None;
        }
        node.parent().map(Path::to_path_buf)
    }

    fn name(&self, node: &PathBuf) -> String {
        node.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string())
    }

    fn exists(&self, node: &PathBuf) -> bool {
        node.exists()
    }

    fn is_dir(&self, node: &PathBuf) -> bool {
        node.is_dir()
    }

    fn is_file(&self, node: &PathBuf) -> bool {
        node.is_file()
    }

    fn can_read(&self, node: &PathBuf) -> bool {
        self.metadata(node)
            .is_some_and(|m| m.permissions().mode() & 0o444 != 0)
    }

    fn can_write(&self, node: &PathBuf) -> bool {
        self.metadata(node).is_some_and(|m| !m.permissions().readonly())
    }

    fn len(&self, node: &PathBuf) -> u64 {
        match self.metadata(node) {
            Some(m) if m.is_file() => m.len(),
            _ => 0,
        }
    }

    fn last_modified(&self, node: &PathBuf) -> Option<SystemTime> {
        self.metadata(node).and_then(|m| m.modified().ok())
    }

    fn set_last_modified(&self, node: &PathBuf, time: SystemTime) -> Result<()> {
        let file = fs::File::open(node).map_err(|e| FsalError::io(format!("open {:?}", node), e))?;
        file.set_modified(time)
            .map_err(|e| FsalError::io(format!("set mtime {:?}", node), e))?;
        debug!("SETMTIME: {:?}", node);
        Ok(())
    }

    fn create_dir(&self, parent: &PathBuf, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        let path = parent.join(name);
        fs::create_dir(&path).map_err(|e| FsalError::io(format!("create directory {:?}", path), e))?;
        debug!("MKDIR: {:?}", path);
        Ok(path)
    }

    fn create_file(&self, parent: &PathBuf, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        let path = parent.join(name);
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FsalError::io(format!("create file {:?}", path), e))?;
        debug!("CREATE: {:?}", path);
        Ok(path)
    }

    fn delete(&self, node: &PathBuf) -> Result<()> {
        let metadata =
            fs::symlink_metadata(node).map_err(|e| FsalError::io(format!("stat {:?}", node), e))?;
        if metadata.is_dir() {
            fs::remove_dir(node).map_err(|e| FsalError::io(format!("remove directory {:?}", node), e))?;
        } else {
            fs::remove_file(node).map_err(|e| FsalError::io(format!("remove file {:?}", node), e))?;
        }
        debug!("REMOVE: {:?}", node);
        Ok(())
    }

    fn rename(&self, node: &PathBuf, new_name: &str) -> Result<PathBuf> {
        let parent = self
            .parent(node)
            .ok_or_else(|| FsalError::PermissionDenied("cannot rename the root".to_string()))?;
        self.move_to(node, &parent, new_name)
    }

    fn move_to(&self, node: &PathBuf, new_parent: &PathBuf, new_name: &str) -> Result<PathBuf> {
        Self::validate_name(new_name)?;
        let target = new_parent.join(new_name);
        fs::rename(node, &target)
            .map_err(|e| FsalError::io(format!("rename {:?} to {:?}", node, target), e))?;
        debug!("RENAME: {:?} -> {:?}", node, target);
        Ok(target)
    }

    fn list(&self, dir: &PathBuf) -> Result<Vec<PathBuf>> {
        let read_dir = fs::read_dir(dir).map_err(|e| FsalError::io(format!("read directory {:?}", dir), e))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| FsalError::io(format!("read entry in {:?}", dir), e))?;
            let path = entry.path();
            // Dangling or escaping symlinks are left out of listings
            if self.within_root(&path).unwrap_or(false) {
                entries.push(path);
            }
        }
        entries.sort();

        debug!("READDIR: {:?} -> {} entries", dir, entries.len());
        Ok(entries)
    }

    fn open_read(&self, node: &PathBuf, offset: u64) -> Result<Box<dyn Read + Send>> {
        let mut file = fs::File::open(node).map_err(|e| FsalError::io(format!("open {:?}", node), e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| FsalError::io(format!("seek {:?}", node), e))?;
        }
        debug!("READ: {:?} offset={}", node, offset);
        Ok(Box::new(file))
    }

    fn open_write(&self, node: &PathBuf, mode: WriteMode) -> Result<Box<dyn Write + Send>> {
        let mut options = fs::OpenOptions::new();
        options.write(true);
        match mode {
            WriteMode::Truncate => {
                options.create(true).truncate(true);
            }
            WriteMode::Append => {
                options.append(true);
            }
            WriteMode::At(_) => {}
        }

        let mut file = options
            .open(node)
            .map_err(|e| FsalError::io(format!("open {:?} for writing", node), e))?;
        if let WriteMode::At(offset) = mode {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| FsalError::io(format!("seek {:?}", node), e))?;
        }

        debug!("WRITE: {:?} mode={:?}", node, mode);
        Ok(Box::new(file))
    }
}
