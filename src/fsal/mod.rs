// Filesystem Abstraction Layer (FSAL)
//
// Lets a single FTP protocol engine address two asymmetric backing stores
// (direct filesystem paths and permission-scoped provider trees) through one
// uniform FileSystemView / FtpFile contract.

pub mod error;
pub mod factory;
pub mod handle;
pub mod local;
pub mod path;
pub mod pool;
pub mod tree;
pub mod view;

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

pub use error::{FsalError, Result};
pub use factory::{PooledView, ViewFactory};
pub use handle::{Entry, FileHandle};
pub use local::LocalStore;
pub use path::{Location, PathResolver, Resolution};
pub use pool::{FileId, HandlePool};
pub use tree::{DocumentId, DocumentProvider, DocumentTreeStore, MemoryDocumentProvider};
pub use view::{SessionView, ViewState};

/// Backing store kinds a view can be built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Direct filesystem paths with random access
    Local,
    /// Provider tree addressed by document ids, no random access
    DocumentTree,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Local => write!(f, "local"),
            StoreKind::DocumentTree => write!(f, "tree"),
        }
    }
}

/// An authenticated FTP user as seen by the FSAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Login name, also reported as the owner of every file
    pub name: String,
    /// Group name reported for every file
    pub group: String,
    /// Home directory, a virtual path relative to the store root
    pub home: String,
    /// Which backing store this user's view is built on
    pub storage: StoreKind,
    /// Whether the user may create, modify or remove entries
    pub write_permission: bool,
}

impl User {
    /// Create a read-write user homed at the store root
    pub fn new(name: impl Into<String>, storage: StoreKind) -> Self {
        let name = name.into();
        Self {
            group: name.clone(),
            name,
            home: "/".to_string(),
            storage,
            write_permission: true,
        }
    }

    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn read_only(mut self) -> Self {
        self.write_permission = false;
        self
    }
}

/// How an output stream is positioned when opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate, start at offset 0
    Truncate,
    /// Start at the current end of the file
    Append,
    /// Start at an arbitrary offset (random-access stores only)
    At(u64),
}

/// Backing store capability set
///
/// This trait defines what the path resolver and file handles need from a
/// storage backend. Both backends implement it; the differences between them
/// are expressed through `is_random_access` and `supports_cross_parent_move`
/// and through the errors returned for capabilities they lack.
pub trait BackingStore: Send + Sync + 'static {
    /// Store-specific reference to one entry
    type Node: Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Which kind of store this is
    fn kind(&self) -> StoreKind;

    /// Node of the store root (the export)
    fn root(&self) -> Self::Node;

    /// Virtual-root marker
    ///
    /// A requested path that starts with this marker is resolved from the
    /// store root with the marker stripped.
    fn root_sentinel(&self) -> &str;

    /// Store-specific absoluteness test for a requested path
    fn is_absolute(&self, path: &str) -> bool {
        path.starts_with('/')
    }

    /// Whether streams can be opened at arbitrary offsets
    fn is_random_access(&self) -> bool;

    /// Whether `move_to` can atomically move an entry to another directory
    fn supports_cross_parent_move(&self) -> bool;

    /// Look up a child by name
    ///
    /// # Returns
    /// `Ok(None)` when the directory has no entry with that name
    fn find_child(&self, dir: &Self::Node, name: &str) -> Result<Option<Self::Node>>;

    /// Parent directory, `None` for the root
    fn parent(&self, node: &Self::Node) -> Option<Self::Node>;

    /// Entry name as stored in its parent directory
    fn name(&self, node: &Self::Node) -> String;

    fn exists(&self, node: &Self::Node) -> bool;
    fn is_dir(&self, node: &Self::Node) -> bool;
    fn is_file(&self, node: &Self::Node) -> bool;
    fn can_read(&self, node: &Self::Node) -> bool;
    fn can_write(&self, node: &Self::Node) -> bool;

    /// Size in bytes (0 for directories and missing entries)
    fn len(&self, node: &Self::Node) -> u64;

    fn last_modified(&self, node: &Self::Node) -> Option<SystemTime>;

    fn set_last_modified(&self, node: &Self::Node, time: SystemTime) -> Result<()> {
        let _ = (node, time);
        Err(FsalError::Unsupported("set last-modified time".to_string()))
    }

    /// Create a directory named `name` inside `parent`
    fn create_dir(&self, parent: &Self::Node, name: &str) -> Result<Self::Node>;

    /// Create an empty file named `name` inside `parent`
    fn create_file(&self, parent: &Self::Node, name: &str) -> Result<Self::Node>;

    /// Delete a file or an empty directory
    fn delete(&self, node: &Self::Node) -> Result<()>;

    /// Rename within the same parent directory
    fn rename(&self, node: &Self::Node, new_name: &str) -> Result<Self::Node>;

    /// Move to a different parent directory
    fn move_to(&self, node: &Self::Node, new_parent: &Self::Node, new_name: &str) -> Result<Self::Node> {
        let _ = (node, new_parent, new_name);
        Err(FsalError::Unsupported("cross-directory move".to_string()))
    }

    /// Children of a directory
    fn list(&self, dir: &Self::Node) -> Result<Vec<Self::Node>>;

    /// Open an input stream positioned at `offset`
    fn open_read(&self, node: &Self::Node, offset: u64) -> Result<Box<dyn Read + Send>>;

    /// Open an output stream on an existing file
    fn open_write(&self, node: &Self::Node, mode: WriteMode) -> Result<Box<dyn Write + Send>>;
}

/// Per-entry contract exposed to the protocol engine
///
/// Metadata queries never fail; a backing-store error reads as "no".
/// Only stream opens report a typed error.
pub trait FtpFile: Send {
    /// Canonical absolute path in the view ("/" for the store root)
    fn absolute_path(&self) -> &str;

    /// Last path segment ("/" for the store root)
    fn name(&self) -> &str;

    fn is_hidden(&self) -> bool;
    fn is_directory(&self) -> bool;
    fn is_file(&self) -> bool;
    fn exists(&self) -> bool;
    fn is_readable(&self) -> bool;
    fn is_writable(&self) -> bool;
    fn is_removable(&self) -> bool;

    fn owner(&self) -> &str;
    fn group(&self) -> &str;
    fn link_count(&self) -> u32;

    fn size(&self) -> u64;
    fn last_modified(&self) -> Option<SystemTime>;
    fn set_last_modified(&self, time: SystemTime) -> bool;

    /// Create this entry as a directory
    fn mkdir(&mut self) -> bool;

    /// Delete this entry (directories must be empty)
    fn delete(&mut self) -> bool;

    /// Open an input stream, skipping the first `offset` bytes
    fn open_read(&self, offset: u64) -> Result<Box<dyn Read + Send>>;

    /// Open an output stream
    ///
    /// Offset 0 truncates (creating the file if needed), an offset equal to
    /// the current size appends, any other offset needs random access.
    fn open_write(&mut self, offset: u64) -> Result<Box<dyn Write + Send>>;
}

/// Per-session contract exposed to the protocol engine
///
/// Handles are addressed by `FileId`; an id becomes invalid once the handle
/// is released or the view is disposed, and looking it up then yields `None`.
pub trait FileSystemView: Send {
    fn home_directory(&mut self) -> Option<FileId>;
    fn working_directory(&mut self) -> Option<FileId>;

    /// Absolute path of the working directory
    fn working_path(&self) -> &str;

    /// Change the working directory, leaving it unchanged on failure
    fn change_working_directory(&mut self, path: &str) -> bool;

    /// Resolve a path to a handle, existing or create-pending
    ///
    /// # Returns
    /// `None` if the path is malformed or an intermediate directory is missing
    fn get_file(&mut self, path: &str) -> Option<FileId>;

    fn file(&self, id: FileId) -> Option<&dyn FtpFile>;
    fn file_mut(&mut self, id: FileId) -> Option<&mut dyn FtpFile>;

    /// List a directory
    ///
    /// # Returns
    /// `None` if the handle does not denote an existing directory,
    /// `Some(vec![])` for an empty one
    fn list_files(&mut self, dir: FileId) -> Option<Vec<FileId>>;

    /// Move (rename) `from` to the location denoted by `to`
    fn move_file(&mut self, from: FileId, to: FileId) -> bool;

    /// Return a single handle to the pool
    fn release_file(&mut self, id: FileId) -> bool;

    /// Whether REST/resume style offsets are supported
    fn is_random_accessible(&self) -> bool;

    fn state(&self) -> ViewState;

    /// Release every handle issued by this view (idempotent)
    ///
    /// A view obtained from `ViewFactory::create_view` must be handed back
    /// through `ViewFactory::save_view` when the session ends, which disposes
    /// it and returns it to its store's pool. Calling `dispose` alone only
    /// frees the handles; the view is then dropped and never reused.
    fn dispose(&mut self);
}

/// Filesystem backend configuration
#[derive(Clone)]
pub struct BackendConfig {
    /// Export root for the local backend
    pub local_root: Option<PathBuf>,
    /// Provider for the document-tree backend
    pub document_tree: Option<Arc<dyn DocumentProvider>>,
    /// Maximum number of disposed views kept per store kind
    pub max_pooled_views: usize,
}

impl BackendConfig {
    pub const DEFAULT_MAX_POOLED_VIEWS: usize = 16;

    /// Create a local filesystem backend configuration
    pub fn local<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            local_root: Some(root.into()),
            document_tree: None,
            max_pooled_views: Self::DEFAULT_MAX_POOLED_VIEWS,
        }
    }

    /// Create a document-tree backend configuration
    pub fn document_tree(provider: Arc<dyn DocumentProvider>) -> Self {
        Self {
            local_root: None,
            document_tree: Some(provider),
            max_pooled_views: Self::DEFAULT_MAX_POOLED_VIEWS,
        }
    }

    pub fn with_local<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.local_root = Some(root.into());
        self
    }

    pub fn with_document_tree(mut self, provider: Arc<dyn DocumentProvider>) -> Self {
        self.document_tree = Some(provider);
        self
    }

    pub fn with_max_pooled_views(mut self, max: usize) -> Self {
        self.max_pooled_views = max;
        self
    }

    /// Build the stores and the view factory
    ///
    /// Fails if no backend is configured or the local root is unusable.
    pub fn create_factory(&self) -> Result<ViewFactory> {
        if self.local_root.is_none() && self.document_tree.is_none() {
            return Err(FsalError::NotConfigured("no backend configured".to_string()));
        }

        let local = match &self.local_root {
            Some(root) => Some(Arc::new(LocalStore::new(root)?)),
            None => None,
        };
        let tree = self
            .document_tree
            .as_ref()
            .map(|provider| Arc::new(DocumentTreeStore::new(provider.clone())));

        Ok(ViewFactory::new(local, tree, self.max_pooled_views))
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("local_root", &self.local_root)
            .field("document_tree", &self.document_tree.as_ref().map(|p| p.root_label()))
            .field("max_pooled_views", &self.max_pooled_views)
            .finish()
    }
}
