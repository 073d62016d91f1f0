// View Factory
//
// Builds session views for authenticated users and recycles disposed ones.
// Each configured backing store keeps its own bounded free list of views.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::local::LocalStore;
use super::tree::DocumentTreeStore;
use super::view::SessionView;
use super::{BackingStore, FileSystemView, FsalError, Result, StoreKind, User};

/// A session view over whichever store the user was routed to
pub enum PooledView {
    Local(SessionView<LocalStore>),
    DocumentTree(SessionView<DocumentTreeStore>),
}

impl PooledView {
    pub fn kind(&self) -> StoreKind {
        match self {
            PooledView::Local(_) => StoreKind::Local,
            PooledView::DocumentTree(_) => StoreKind::DocumentTree,
        }
    }
}

impl Deref for PooledView {
    type Target = dyn FileSystemView;

    fn deref(&self) -> &Self::Target {
        match self {
            PooledView::Local(view) => view,
            PooledView::DocumentTree(view) => view,
        }
    }
}

impl DerefMut for PooledView {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            PooledView::Local(view) => view,
            PooledView::DocumentTree(view) => view,
        }
    }
}

/// Store plus its free list of disposed views
struct StorePool<S: BackingStore> {
    store: Arc<S>,
    idle: Mutex<Vec<SessionView<S>>>,
}

impl<S: BackingStore> StorePool<S> {
    fn new(store: Arc<S>) -> Self {
        Self {
            store,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self, user: &User) -> Result<SessionView<S>> {
        // The lock covers only the pop; reinitialization runs unlocked
        let recycled = self.idle.lock().pop();
        match recycled {
            Some(mut view) => {
                debug!("Reusing pooled {} view for {}", self.store.kind(), user.name);
                view.reinitialize(user)?;
                Ok(view)
            }
            None => SessionView::new(self.store.clone(), user),
        }
    }

    fn checkin(&self, mut view: SessionView<S>, max: usize) {
        view.dispose();
        let mut idle = self.idle.lock();
        if idle.len() < max {
            idle.push(view);
        } else {
            debug!("{} view pool full, dropping view", self.store.kind());
        }
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Hands out views for authenticated users
///
/// Safe to share across session threads.
pub struct ViewFactory {
    local: Option<StorePool<LocalStore>>,
    tree: Option<StorePool<DocumentTreeStore>>,
    max_pooled_views: usize,
}

impl ViewFactory {
    /// Create a factory over the configured stores
    ///
    /// # Arguments
    /// * `local` - Direct-path store, if configured
    /// * `tree` - Provider-tree store, if configured
    /// * `max_pooled_views` - Idle views kept per store
    pub fn new(
        local: Option<Arc<LocalStore>>,
        tree: Option<Arc<DocumentTreeStore>>,
        max_pooled_views: usize,
    ) -> Self {
        info!(
            "View factory ready (local: {}, tree: {}, pool cap {})",
            local.is_some(),
            tree.is_some(),
            max_pooled_views
        );
        Self {
            local: local.map(StorePool::new),
            tree: tree.map(StorePool::new),
            max_pooled_views,
        }
    }

    /// Whether a store of this kind is configured
    pub fn supports(&self, kind: StoreKind) -> bool {
        match kind {
            StoreKind::Local => self.local.is_some(),
            StoreKind::DocumentTree => self.tree.is_some(),
        }
    }

    /// Produce a view for `user`, recycling a pooled one when available
    ///
    /// # Returns
    /// A view in the Initialized state with its working directory at the
    /// user's home, or an error if the user's store is not configured or
    /// the home directory cannot be resolved.
    pub fn create_view(&self, user: &User) -> Result<PooledView> {
        match user.storage {
            StoreKind::Local => {
                let pool = self.local.as_ref().ok_or_else(|| not_configured(StoreKind::Local))?;
                pool.checkout(user).map(PooledView::Local)
            }
            StoreKind::DocumentTree => {
                let pool = self
                    .tree
                    .as_ref()
                    .ok_or_else(|| not_configured(StoreKind::DocumentTree))?;
                pool.checkout(user).map(PooledView::DocumentTree)
            }
        }
    }

    /// Dispose a view and return it to its store's pool
    ///
    /// Taking the view by value makes a second save impossible.
    pub fn save_view(&self, view: PooledView) {
        match view {
            PooledView::Local(view) => {
                if let Some(pool) = &self.local {
                    pool.checkin(view, self.max_pooled_views);
                }
            }
            PooledView::DocumentTree(view) => {
                if let Some(pool) = &self.tree {
                    pool.checkin(view, self.max_pooled_views);
                }
            }
        }
    }

    /// Number of idle views held for `kind`
    pub fn pooled_views(&self, kind: StoreKind) -> usize {
        match kind {
            StoreKind::Local => self.local.as_ref().map_or(0, StorePool::idle_len),
            StoreKind::DocumentTree => self.tree.as_ref().map_or(0, StorePool::idle_len),
        }
    }

    pub fn max_pooled_views(&self) -> usize {
        self.max_pooled_views
    }
}

fn not_configured(kind: StoreKind) -> FsalError {
    FsalError::NotConfigured(format!("{} store", kind))
}
