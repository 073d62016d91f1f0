// Session File-System View
//
// One SessionView serves one FTP session. It owns the working-directory
// cursor and the handle pool, and turns resolver and store failures into the
// boolean / Option answers the protocol engine expects.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::handle::{Entry, FileHandle};
use super::path::{child_path, Location, PathResolver};
use super::pool::{FileId, HandlePool};
use super::{BackingStore, FileSystemView, FsalError, FtpFile, Result, User};

/// Lifecycle of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Built or re-initialized for a user, no command served yet
    Initialized,
    /// Serving commands
    Active,
    /// Handles released; only the factory may bring it back
    Disposed,
}

/// File-system view bound to one backing store and one user
pub struct SessionView<S: BackingStore> {
    store: Arc<S>,
    user: Arc<User>,
    home: Location<S::Node>,
    cwd: Location<S::Node>,
    pool: HandlePool<S>,
    state: ViewState,
}

impl<S: BackingStore> SessionView<S> {
    /// Create a view for `user`
    ///
    /// Fails if the user's home directory does not exist on the store.
    pub fn new(store: Arc<S>, user: &User) -> Result<Self> {
        let user = Arc::new(user.clone());
        let home = resolve_home(store.as_ref(), &user)?;
        info!("View created for {} on {} store, home {}", user.name, store.kind(), home.path);

        Ok(Self {
            pool: HandlePool::new(store.clone()),
            cwd: home.clone(),
            home,
            store,
            user,
            state: ViewState::Initialized,
        })
    }

    /// Prepare a pooled view for a new session
    ///
    /// Every piece of per-session state is replaced; handles left over from
    /// the previous session are released.
    pub(crate) fn reinitialize(&mut self, user: &User) -> Result<()> {
        let leftover = self.pool.release_all();
        if leftover > 0 {
            warn!("Recycled view still had {} issued handles", leftover);
        }

        let user = Arc::new(user.clone());
        let home = resolve_home(self.store.as_ref(), &user)?;
        info!("View recycled for {} on {} store, home {}", user.name, self.store.kind(), home.path);

        self.cwd = home.clone();
        self.home = home;
        self.user = user;
        self.state = ViewState::Initialized;
        Ok(())
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn pool(&self) -> &HandlePool<S> {
        &self.pool
    }

    /// Typed access to an issued handle
    pub fn handle(&self, id: FileId) -> Option<&FileHandle<S>> {
        self.pool.get(id)
    }

    /// Mark the view active, refusing if it has been disposed
    fn begin_command(&mut self) -> bool {
        match self.state {
            ViewState::Disposed => {
                warn!("Command on disposed view of {}", self.user.name);
                false
            }
            ViewState::Initialized | ViewState::Active => {
                self.state = ViewState::Active;
                true
            }
        }
    }

    fn issue(&mut self, path: &str, entry: Entry<S::Node>) -> FileId {
        self.pool.acquire(path, entry, self.user.clone())
    }
}

impl<S: BackingStore> FileSystemView for SessionView<S> {
    fn home_directory(&mut self) -> Option<FileId> {
        if !self.begin_command() {
            return None;
        }
        let Location { path, node } = self.home.clone();
        Some(self.issue(&path, Entry::Resolved(node)))
    }

    fn working_directory(&mut self) -> Option<FileId> {
        if !self.begin_command() {
            return None;
        }
        let Location { path, node } = self.cwd.clone();
        Some(self.issue(&path, Entry::Resolved(node)))
    }

    fn working_path(&self) -> &str {
        &self.cwd.path
    }

    fn change_working_directory(&mut self, path: &str) -> bool {
        if !self.begin_command() {
            return false;
        }

        let resolution = match PathResolver::new(self.store.as_ref()).resolve(&self.cwd, path) {
            Ok(resolution) => resolution,
            Err(e) => {
                debug!("CWD {:?} failed: {}", path, e);
                return false;
            }
        };

        match resolution.entry {
            Entry::Resolved(node) if self.store.is_dir(&node) => {
                if resolution.path == self.cwd.path {
                    debug!("CWD {:?}: already in {}", path, self.cwd.path);
                    return true;
                }
                debug!("CWD {:?}: {} -> {}", path, self.cwd.path, resolution.path);
                self.cwd = Location {
                    path: resolution.path,
                    node,
                };
                true
            }
            _ => {
                debug!("CWD {:?} failed: {} is not an existing directory", path, resolution.path);
                false
            }
        }
    }

    fn get_file(&mut self, path: &str) -> Option<FileId> {
        if !self.begin_command() {
            return None;
        }

        match PathResolver::new(self.store.as_ref()).resolve(&self.cwd, path) {
            Ok(resolution) => Some(self.issue(&resolution.path, resolution.entry)),
            Err(e) => {
                debug!("GETFILE {:?} failed: {}", path, e);
                None
            }
        }
    }

    fn file(&self, id: FileId) -> Option<&dyn FtpFile> {
        self.pool.get(id).map(|handle| handle as &dyn FtpFile)
    }

    fn file_mut(&mut self, id: FileId) -> Option<&mut dyn FtpFile> {
        self.pool.get_mut(id).map(|handle| handle as &mut dyn FtpFile)
    }

    fn list_files(&mut self, dir: FileId) -> Option<Vec<FileId>> {
        if !self.begin_command() {
            return None;
        }

        let handle = self.pool.get(dir)?;
        let (dir_path, node) = match handle.entry() {
            Entry::Resolved(node) if self.store.exists(node) && self.store.is_dir(node) => {
                (handle.absolute_path().to_string(), node.clone())
            }
            _ => return None,
        };

        let store = self.store.clone();
        let children = match store.list(&node) {
            Ok(children) => children,
            Err(e) => {
                warn!("LIST {} failed: {}", dir_path, e);
                return None;
            }
        };

        let ids = children
            .into_iter()
            .map(|child| {
                let path = child_path(&dir_path, &store.name(&child));
                self.issue(&path, Entry::Resolved(child))
            })
            .collect();
        Some(ids)
    }

    fn move_file(&mut self, from: FileId, to: FileId) -> bool {
        if !self.begin_command() {
            return false;
        }
        match (self.pool.get(from), self.pool.get(to)) {
            (Some(source), Some(dest)) => source.move_to(dest),
            _ => false,
        }
    }

    fn release_file(&mut self, id: FileId) -> bool {
        self.pool.release(id)
    }

    fn is_random_accessible(&self) -> bool {
        self.store.is_random_access()
    }

    fn state(&self) -> ViewState {
        self.state
    }

    fn dispose(&mut self) {
        if self.state == ViewState::Disposed {
            return;
        }
        let released = self.pool.release_all();
        self.state = ViewState::Disposed;
        info!("View of {} disposed, {} handles released", self.user.name, released);
    }
}

/// Resolve a user's home directory from the store root
fn resolve_home<S: BackingStore>(store: &S, user: &User) -> Result<Location<S::Node>> {
    let root = Location {
        path: "/".to_string(),
        node: store.root(),
    };
    let resolution = PathResolver::new(store).resolve(&root, &user.home)?;
    match resolution.entry {
        Entry::Resolved(node) if store.is_dir(&node) => Ok(Location {
            path: resolution.path,
            node,
        }),
        Entry::Resolved(_) => Err(FsalError::NotADirectory(resolution.path)),
        Entry::Pending { .. } => Err(FsalError::NotFound(resolution.path)),
    }
}
