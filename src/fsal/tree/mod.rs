// Document Tree Backend
//
// A provider tree is addressed by opaque document ids that are only reachable
// through parent/child traversal. It has no random access and no
// cross-directory move. DocumentTreeStore adapts such a provider to the
// BackingStore contract.

pub mod memory;

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use super::{BackingStore, FsalError, Result, StoreKind, WriteMode};

pub use memory::MemoryDocumentProvider;

/// Opaque document identifier issued by a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability surface of a content-provider tree
///
/// Queries answer "no" (or 0 / `None`) for documents that are missing or
/// cannot be inspected, the way a provider cursor comes back empty.
pub trait DocumentProvider: Send + Sync {
    /// Root document of the granted tree
    fn root(&self) -> DocumentId;

    /// Label clients may use as the virtual root of this tree
    fn root_label(&self) -> &str;

    fn exists(&self, id: &DocumentId) -> bool;
    fn is_directory(&self, id: &DocumentId) -> bool;
    fn is_file(&self, id: &DocumentId) -> bool;
    fn can_read(&self, id: &DocumentId) -> bool;
    fn can_write(&self, id: &DocumentId) -> bool;
    fn length(&self, id: &DocumentId) -> u64;
    fn last_modified(&self, id: &DocumentId) -> Option<SystemTime>;

    /// Display name of a document
    fn display_name(&self, id: &DocumentId) -> Option<String>;

    /// Parent document, `None` for the tree root
    fn parent(&self, id: &DocumentId) -> Option<DocumentId>;

    fn find_child(&self, parent: &DocumentId, name: &str) -> io::Result<Option<DocumentId>>;
    fn list_children(&self, parent: &DocumentId) -> io::Result<Vec<DocumentId>>;

    fn create_file(&self, parent: &DocumentId, mime_type: &str, name: &str) -> io::Result<DocumentId>;
    fn create_directory(&self, parent: &DocumentId, name: &str) -> io::Result<DocumentId>;

    /// Delete a document; directories are deleted with their contents
    fn delete(&self, id: &DocumentId) -> io::Result<()>;

    /// Rename in place, returning the (possibly new) id
    fn rename(&self, id: &DocumentId, name: &str) -> io::Result<DocumentId>;

    /// Open an input stream at offset 0
    fn open_read(&self, id: &DocumentId) -> io::Result<Box<dyn Read + Send>>;

    /// Open an output stream at offset 0 (truncating) or at the end (append)
    fn open_write(&self, id: &DocumentId, append: bool) -> io::Result<Box<dyn Write + Send>>;
}

/// BackingStore over a DocumentProvider
pub struct DocumentTreeStore {
    provider: Arc<dyn DocumentProvider>,
}

impl DocumentTreeStore {
    pub fn new(provider: Arc<dyn DocumentProvider>) -> Self {
        debug!("DocumentTreeStore created with root: {}", provider.root());
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn DocumentProvider> {
        &self.provider
    }
}

impl BackingStore for DocumentTreeStore {
    type Node = DocumentId;

    fn kind(&self) -> StoreKind {
        StoreKind::DocumentTree
    }

    fn root(&self) -> DocumentId {
        self.provider.root()
    }

    fn root_sentinel(&self) -> &str {
        self.provider.root_label()
    }

    fn is_random_access(&self) -> bool {
        false
    }

    fn supports_cross_parent_move(&self) -> bool {
        false
    }

    fn find_child(&self, dir: &DocumentId, name: &str) -> Result<Option<DocumentId>> {
        self.provider
            .find_child(dir, name)
            .map_err(|e| FsalError::io(format!("find {:?} in {}", name, dir), e))
    }

    fn parent(&self, node: &DocumentId) -> Option<DocumentId> {
        self.provider.parent(node)
    }

    fn name(&self, node: &DocumentId) -> String {
        self.provider.display_name(node).unwrap_or_default()
    }

    fn exists(&self, node: &DocumentId) -> bool {
        self.provider.exists(node)
    }

    fn is_dir(&self, node: &DocumentId) -> bool {
        self.provider.is_directory(node)
    }

    fn is_file(&self, node: &DocumentId) -> bool {
        self.provider.is_file(node)
    }

    fn can_read(&self, node: &DocumentId) -> bool {
        self.provider.can_read(node)
    }

    fn can_write(&self, node: &DocumentId) -> bool {
        self.provider.can_write(node)
    }

    fn len(&self, node: &DocumentId) -> u64 {
        self.provider.length(node)
    }

    fn last_modified(&self, node: &DocumentId) -> Option<SystemTime> {
        self.provider.last_modified(node)
    }

    fn create_dir(&self, parent: &DocumentId, name: &str) -> Result<DocumentId> {
        if self.find_child(parent, name)?.is_some() {
            return Err(FsalError::AlreadyExists(name.to_string()));
        }
        let id = self
            .provider
            .create_directory(parent, name)
            .map_err(|e| FsalError::io(format!("create directory {:?} in {}", name, parent), e))?;
        debug!("MKDIR: {} -> {}", name, id);
        Ok(id)
    }

    fn create_file(&self, parent: &DocumentId, name: &str) -> Result<DocumentId> {
        if self.find_child(parent, name)?.is_some() {
            return Err(FsalError::AlreadyExists(name.to_string()));
        }
        let mime_type = mime_type_for(name);
        let id = self
            .provider
            .create_file(parent, mime_type, name)
            .map_err(|e| FsalError::io(format!("create file {:?} in {}", name, parent), e))?;
        debug!("CREATE: {} ({}) -> {}", name, mime_type, id);
        Ok(id)
    }

    fn delete(&self, node: &DocumentId) -> Result<()> {
        if self.provider.is_directory(node) {
            let children = self
                .provider
                .list_children(node)
                .map_err(|e| FsalError::io(format!("list {}", node), e))?;
            if !children.is_empty() {
                return Err(FsalError::PermissionDenied(format!("directory {} is not empty", node)));
            }
        }
        self.provider
            .delete(node)
            .map_err(|e| FsalError::io(format!("delete {}", node), e))?;
        debug!("REMOVE: {}", node);
        Ok(())
    }

    fn rename(&self, node: &DocumentId, new_name: &str) -> Result<DocumentId> {
        if let Some(parent) = self.provider.parent(node) {
            if self.find_child(&parent, new_name)?.is_some() {
                return Err(FsalError::AlreadyExists(new_name.to_string()));
            }
        }
        let id = self
            .provider
            .rename(node, new_name)
            .map_err(|e| FsalError::io(format!("rename {} to {:?}", node, new_name), e))?;
        debug!("RENAME: {} -> {}", node, id);
        Ok(id)
    }

    fn list(&self, dir: &DocumentId) -> Result<Vec<DocumentId>> {
        let children = self
            .provider
            .list_children(dir)
            .map_err(|e| FsalError::io(format!("list {}", dir), e))?;
        debug!("READDIR: {} -> {} entries", dir, children.len());
        Ok(children)
    }

    fn open_read(&self, node: &DocumentId, offset: u64) -> Result<Box<dyn Read + Send>> {
        let mut reader = self
            .provider
            .open_read(node)
            .map_err(|e| FsalError::io(format!("open {}", node), e))?;

        // Streams always start at 0; emulate the offset by discarding bytes
        if offset > 0 {
            let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())
                .map_err(|e| FsalError::io(format!("skip {} bytes of {}", offset, node), e))?;
            debug!("READ: {} skipped {} of {} bytes", node, skipped, offset);
        }
        Ok(reader)
    }

    fn open_write(&self, node: &DocumentId, mode: WriteMode) -> Result<Box<dyn Write + Send>> {
        let append = match mode {
            WriteMode::Truncate => false,
            WriteMode::Append => true,
            WriteMode::At(offset) => {
                return Err(FsalError::Unsupported(format!(
                    "write at offset {} on {}: provider tree has no random access",
                    offset, node
                )));
            }
        };
        let writer = self
            .provider
            .open_write(node, append)
            .map_err(|e| FsalError::io(format!("open {} for writing", node), e))?;
        debug!("WRITE: {} append={}", node, append);
        Ok(writer)
    }
}

/// MIME type used when creating a document, derived from the extension
pub fn mime_type_for(name: &str) -> &'static str {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("application/octet-stream")
}
