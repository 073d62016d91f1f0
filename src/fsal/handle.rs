// File Handles
//
// A FileHandle wraps one backing-store entry, or a named entry that does not
// exist yet. Handles live in a HandlePool slot and are reused: `bind` gives a
// slot its identity, `clear` drops every backing reference again.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::{BackingStore, FsalError, FtpFile, Result, User, WriteMode};

/// Backing entry of a handle
#[derive(Debug, Clone, PartialEq)]
pub enum Entry<N> {
    /// The store node is known; it may have been removed since
    Resolved(N),
    /// Nothing exists yet; `mkdir` or the first write creates `name` in `parent`
    Pending { parent: N, name: String },
}

/// Identity of a handle while it is issued
struct Binding<N> {
    entry: Entry<N>,
    user: Arc<User>,
}

/// Poolable handle to one entry of a backing store
pub struct FileHandle<S: BackingStore> {
    store: Arc<S>,
    path: String,
    binding: Option<Binding<S::Node>>,
}

impl<S: BackingStore> FileHandle<S> {
    /// Create an unbound handle
    pub(crate) fn new(store: Arc<S>) -> Self {
        Self {
            store,
            path: String::new(),
            binding: None,
        }
    }

    /// Give the handle a new identity
    pub(crate) fn bind(&mut self, path: &str, entry: Entry<S::Node>, user: Arc<User>) {
        self.path.clear();
        self.path.push_str(path);
        self.binding = Some(Binding { entry, user });
    }

    /// Drop the backing reference and user; the path buffer is kept for reuse
    pub(crate) fn clear(&mut self) {
        self.path.clear();
        self.binding = None;
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Current backing entry
    ///
    /// # Panics
    /// If the handle has been returned to its pool
    pub fn entry(&self) -> &Entry<S::Node> {
        &self.binding().entry
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.entry(), Entry::Pending { .. })
    }

    fn binding(&self) -> &Binding<S::Node> {
        match &self.binding {
            Some(binding) => binding,
            None => panic!("file handle used after it was returned to the pool"),
        }
    }

    fn user_can_write(&self) -> bool {
        self.binding().user.write_permission
    }

    fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Node of an existing entry
    fn existing_node(&self) -> Option<&S::Node> {
        match self.entry() {
            Entry::Resolved(node) if self.store.exists(node) => Some(node),
            _ => None,
        }
    }

    /// Writability of the nearest existing ancestor, starting at `node`
    fn nearest_existing_writable(&self, node: &S::Node) -> bool {
        let mut current = Some(node.clone());
        while let Some(node) = current {
            if self.store.exists(&node) {
                return self.store.can_write(&node);
            }
            current = self.store.parent(&node);
        }
        false
    }

    /// Parent directory and name under which this entry would be created
    fn creation_slot(&self) -> Result<(S::Node, String)> {
        match self.entry() {
            Entry::Pending { parent, name } => Ok((parent.clone(), name.clone())),
            Entry::Resolved(node) => {
                let parent = self
                    .store
                    .parent(node)
                    .ok_or_else(|| FsalError::PermissionDenied(self.path.clone()))?;
                Ok((parent, self.name().to_string()))
            }
        }
    }

    /// Replace the backing entry with a freshly created node
    fn materialize(&mut self, node: S::Node) {
        if let Some(binding) = self.binding.as_mut() {
            binding.entry = Entry::Resolved(node);
        }
    }

    /// Move this entry to the location denoted by `dest`
    ///
    /// Same-parent moves are renames. Cross-parent moves use the store's
    /// native move when it has one and otherwise copy then delete, removing
    /// the partial copy if anything fails. The source is never touched unless
    /// the copy succeeded and the whole source tree is deletable.
    pub fn move_to(&self, dest: &FileHandle<S>) -> bool {
        match self.try_move(dest) {
            Ok(()) => {
                info!("MOVE: {} -> {}", self.path, dest.path);
                true
            }
            Err(e) => {
                warn!("MOVE failed: {} -> {}: {}", self.path, dest.path, e);
                false
            }
        }
    }

    fn try_move(&self, dest: &FileHandle<S>) -> Result<()> {
        if !self.user_can_write() {
            return Err(FsalError::PermissionDenied(self.path.clone()));
        }
        if self.is_root() {
            return Err(FsalError::PermissionDenied("cannot move the root".to_string()));
        }
        let source = self
            .existing_node()
            .ok_or_else(|| FsalError::NotFound(self.path.clone()))?;
        if dest.existing_node().is_some() {
            return Err(FsalError::AlreadyExists(dest.path.clone()));
        }
        if dest.path.starts_with(&format!("{}/", self.path)) {
            return Err(FsalError::InvalidPath(format!(
                "cannot move {} into itself",
                self.path
            )));
        }

        let (dest_parent, dest_name) = dest.creation_slot()?;
        let source_parent = self
            .store
            .parent(source)
            .ok_or_else(|| FsalError::PermissionDenied(self.path.clone()))?;

        if source_parent == dest_parent {
            self.store.rename(source, &dest_name)?;
        } else if self.store.supports_cross_parent_move() {
            self.store.move_to(source, &dest_parent, &dest_name)?;
        } else {
            copy_then_delete(self.store.as_ref(), source, &dest_parent, &dest_name)?;
        }
        Ok(())
    }
}

impl<S: BackingStore> FtpFile for FileHandle<S> {
    fn absolute_path(&self) -> &str {
        &self.path
    }

    fn name(&self) -> &str {
        if self.is_root() {
            return "/";
        }
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    fn is_hidden(&self) -> bool {
        self.name().starts_with('.') && !self.is_root()
    }

    fn is_directory(&self) -> bool {
        match self.entry() {
            Entry::Resolved(node) => self.store.is_dir(node),
            Entry::Pending { .. } => false,
        }
    }

    fn is_file(&self) -> bool {
        match self.entry() {
            Entry::Resolved(node) => self.store.is_file(node),
            Entry::Pending { .. } => false,
        }
    }

    fn exists(&self) -> bool {
        match self.entry() {
            Entry::Resolved(node) => self.store.exists(node),
            Entry::Pending { .. } => false,
        }
    }

    fn is_readable(&self) -> bool {
        match self.entry() {
            Entry::Resolved(node) => self.store.exists(node) && self.store.can_read(node),
            Entry::Pending { .. } => false,
        }
    }

    fn is_writable(&self) -> bool {
        if !self.user_can_write() {
            return false;
        }
        match self.entry() {
            Entry::Resolved(node) => self.nearest_existing_writable(node),
            Entry::Pending { parent, .. } => self.nearest_existing_writable(parent),
        }
    }

    fn is_removable(&self) -> bool {
        if !self.user_can_write() || self.is_root() {
            return false;
        }
        match self.existing_node() {
            Some(node) => self
                .store
                .parent(node)
                .is_some_and(|parent| self.store.can_write(&parent)),
            None => false,
        }
    }

    fn owner(&self) -> &str {
        &self.binding().user.name
    }

    fn group(&self) -> &str {
        &self.binding().user.group
    }

    fn link_count(&self) -> u32 {
        if self.is_directory() { 3 } else { 1 }
    }

    fn size(&self) -> u64 {
        match self.entry() {
            Entry::Resolved(node) => self.store.len(node),
            Entry::Pending { .. } => 0,
        }
    }

    fn last_modified(&self) -> Option<SystemTime> {
        match self.entry() {
            Entry::Resolved(node) => self.store.last_modified(node),
            Entry::Pending { .. } => None,
        }
    }

    fn set_last_modified(&self, time: SystemTime) -> bool {
        if !self.user_can_write() {
            return false;
        }
        let Some(node) = self.existing_node() else {
            return false;
        };
        match self.store.set_last_modified(node, time) {
            Ok(()) => true,
            Err(e) => {
                debug!("SETMTIME failed: {}: {}", self.path, e);
                false
            }
        }
    }

    fn mkdir(&mut self) -> bool {
        if !self.user_can_write() || self.exists() {
            return false;
        }
        let created = self
            .creation_slot()
            .and_then(|(parent, name)| self.store.create_dir(&parent, &name));
        match created {
            Ok(node) => {
                self.materialize(node);
                debug!("MKDIR: {}", self.path);
                true
            }
            Err(e) => {
                warn!("MKDIR failed: {}: {}", self.path, e);
                false
            }
        }
    }

    fn delete(&mut self) -> bool {
        if !self.user_can_write() || self.is_root() {
            return false;
        }
        let Some(node) = self.existing_node() else {
            return false;
        };
        match self.store.delete(node) {
            Ok(()) => {
                debug!("DELETE: {}", self.path);
                true
            }
            Err(e) => {
                warn!("DELETE failed: {}: {}", self.path, e);
                false
            }
        }
    }

    fn open_read(&self, offset: u64) -> Result<Box<dyn Read + Send>> {
        let node = match self.entry() {
            Entry::Resolved(node) if self.store.exists(node) => node,
            _ => return Err(FsalError::NotFound(self.path.clone())),
        };
        if self.store.is_dir(node) {
            return Err(FsalError::IsADirectory(self.path.clone()));
        }
        if !self.store.can_read(node) {
            return Err(FsalError::PermissionDenied(self.path.clone()));
        }
        debug!("OPEN READ: {} offset={}", self.path, offset);
        self.store.open_read(node, offset)
    }

    fn open_write(&mut self, offset: u64) -> Result<Box<dyn Write + Send>> {
        if !self.user_can_write() {
            return Err(FsalError::PermissionDenied(self.path.clone()));
        }

        let existing = self.existing_node().cloned();
        let (node, mode) = match existing {
            Some(node) => {
                if self.store.is_dir(&node) {
                    return Err(FsalError::IsADirectory(self.path.clone()));
                }
                let size = self.store.len(&node);
                let mode = if offset == 0 {
                    WriteMode::Truncate
                } else if offset == size {
                    WriteMode::Append
                } else if self.store.is_random_access() {
                    WriteMode::At(offset)
                } else {
                    return Err(FsalError::Unsupported(format!(
                        "write at offset {} of {} (size {}) needs random access",
                        offset, self.path, size
                    )));
                };
                (node, mode)
            }
            None => {
                let mode = if offset == 0 {
                    WriteMode::Truncate
                } else if self.store.is_random_access() {
                    WriteMode::At(offset)
                } else {
                    return Err(FsalError::Unsupported(format!(
                        "write at offset {} of new file {} needs random access",
                        offset, self.path
                    )));
                };
                let (parent, name) = self.creation_slot()?;
                let node = self.store.create_file(&parent, &name)?;
                debug!("CREATE: {}", self.path);

                debug!("OPEN WRITE: {} mode={:?}", self.path, mode);
                let writer = match self.store.open_write(&node, mode) {
                    Ok(writer) => writer,
                    Err(e) => {
                        if let Err(cleanup) = self.store.delete(&node) {
                            warn!("Failed to remove {} after failed open: {}", self.path, cleanup);
                        }
                        return Err(e);
                    }
                };
                self.materialize(node);
                return Ok(writer);
            }
        };

        debug!("OPEN WRITE: {} mode={:?}", self.path, mode);
        self.store.open_write(&node, mode)
    }
}

/// Copy `source` into `parent` as `name`, then delete the source
///
/// The copy is rolled back only while the source is still complete. Once
/// part of the source is gone the copy holds the only full version of the
/// data and is kept.
fn copy_then_delete<S: BackingStore>(
    store: &S,
    source: &S::Node,
    parent: &S::Node,
    name: &str,
) -> Result<()> {
    ensure_removable(store, source)?;
    let copy = copy_tree(store, source, parent, name)?;

    let mut removed = 0;
    if let Err(e) = remove_tree(store, source, &mut removed) {
        if removed == 0 {
            if let Err(cleanup) = remove_tree(store, &copy, &mut 0) {
                warn!("Failed to remove copy {:?} after failed move: {}", copy, cleanup);
            }
        } else {
            warn!(
                "Move of {:?} stopped after removing {} source entries, keeping copy {:?}",
                source, removed, copy
            );
        }
        return Err(e);
    }
    Ok(())
}

/// Check that `node` and everything below it can be deleted
fn ensure_removable<S: BackingStore>(store: &S, node: &S::Node) -> Result<()> {
    let parent_writable = store.parent(node).is_some_and(|parent| store.can_write(&parent));
    if !parent_writable {
        return Err(FsalError::PermissionDenied(format!("cannot remove {:?}", node)));
    }
    ensure_contents_removable(store, node)
}

fn ensure_contents_removable<S: BackingStore>(store: &S, node: &S::Node) -> Result<()> {
    if !store.is_dir(node) {
        return Ok(());
    }
    let children = store.list(node)?;
    if !children.is_empty() && !store.can_write(node) {
        return Err(FsalError::PermissionDenied(format!("cannot empty {:?}", node)));
    }
    for child in &children {
        ensure_contents_removable(store, child)?;
    }
    Ok(())
}

/// Recursively copy `source`; on failure nothing is left behind in `parent`
fn copy_tree<S: BackingStore>(
    store: &S,
    source: &S::Node,
    parent: &S::Node,
    name: &str,
) -> Result<S::Node> {
    let target = if store.is_dir(source) {
        store.create_dir(parent, name)?
    } else {
        store.create_file(parent, name)?
    };

    let copied = if store.is_dir(source) {
        copy_children(store, source, &target)
    } else {
        copy_contents(store, source, &target)
    };

    if let Err(e) = copied {
        if let Err(cleanup) = remove_tree(store, &target, &mut 0) {
            warn!("Failed to roll back partial copy {:?}: {}", target, cleanup);
        }
        return Err(e);
    }
    Ok(target)
}

fn copy_children<S: BackingStore>(store: &S, source: &S::Node, target: &S::Node) -> Result<()> {
    for child in store.list(source)? {
        copy_tree(store, &child, target, &store.name(&child))?;
    }
    Ok(())
}

fn copy_contents<S: BackingStore>(store: &S, source: &S::Node, target: &S::Node) -> Result<()> {
    let mut reader = store.open_read(source, 0)?;
    let mut writer = store.open_write(target, WriteMode::Truncate)?;
    let context = || format!("copy {:?} -> {:?}", source, target);
    io::copy(&mut reader, &mut writer).map_err(|e| FsalError::io(context(), e))?;
    writer.flush().map_err(|e| FsalError::io(context(), e))?;
    Ok(())
}

/// Delete a node and, for directories, everything below it
///
/// `removed` counts the entries deleted so far, including on failure.
fn remove_tree<S: BackingStore>(store: &S, node: &S::Node, removed: &mut usize) -> Result<()> {
    if store.is_dir(node) {
        for child in store.list(node)? {
            remove_tree(store, &child, removed)?;
        }
    }
    store.delete(node)?;
    *removed += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsal::{DocumentId, DocumentProvider, DocumentTreeStore, LocalStore, MemoryDocumentProvider, StoreKind};
    use std::fs;
    use tempfile::TempDir;

    fn tree_store() -> (Arc<DocumentTreeStore>, Arc<MemoryDocumentProvider>) {
        let provider = Arc::new(MemoryDocumentProvider::new("primary:"));
        (Arc::new(DocumentTreeStore::new(provider.clone())), provider)
    }

    fn bound<S: BackingStore>(store: &Arc<S>, path: &str, entry: Entry<S::Node>, user: &Arc<User>) -> FileHandle<S> {
        let mut handle = FileHandle::new(store.clone());
        handle.bind(path, entry, user.clone());
        handle
    }

    fn tree_user() -> Arc<User> {
        Arc::new(User::new("alice", StoreKind::DocumentTree).with_group("staff"))
    }

    fn read_all(handle: &FileHandle<DocumentTreeStore>, offset: u64) -> Vec<u8> {
        let mut data = Vec::new();
        handle
            .open_read(offset)
            .expect("Failed to open for read")
            .read_to_end(&mut data)
            .expect("Failed to read");
        data
    }

    #[test]
    fn test_pending_metadata() {
        let (store, _provider) = tree_store();
        let user = tree_user();
        let handle = bound(
            &store,
            "/new.txt",
            Entry::Pending { parent: store.root(), name: "new.txt".to_string() },
            &user,
        );

        assert!(!handle.exists());
        assert!(!handle.is_file());
        assert!(!handle.is_directory());
        assert!(!handle.is_readable());
        assert!(!handle.is_removable());
        assert_eq!(handle.size(), 0);
        assert!(handle.last_modified().is_none());
        assert!(handle.is_writable(), "Pending entry takes the parent's writability");
        assert_eq!(handle.name(), "new.txt");
        assert_eq!(handle.owner(), "alice");
        assert_eq!(handle.group(), "staff");
    }

    #[test]
    fn test_pending_writability_follows_parent() {
        let (store, provider) = tree_store();
        let locked = provider.mkdirs("locked").expect("Failed to create dir");
        provider.set_writable(&locked, false);
        let user = tree_user();

        let handle = bound(
            &store,
            "/locked/new.txt",
            Entry::Pending { parent: locked, name: "new.txt".to_string() },
            &user,
        );
        assert!(!handle.is_writable());
    }

    #[test]
    fn test_writable_walks_up_to_existing_ancestor() {
        let (store, provider) = tree_store();
        let dir = provider.mkdirs("a/b").expect("Failed to create dirs");
        let a = store.parent(&dir).expect("b has a parent");
        let user = tree_user();
        let handle = bound(&store, "/a/b", Entry::Resolved(dir.clone()), &user);

        // Remove b: the handle now denotes a missing entry under a
        provider.delete(&dir).expect("Failed to delete");
        assert!(!handle.exists());
        assert!(handle.is_writable());

        provider.set_writable(&a, false);
        assert!(!handle.is_writable());
    }

    #[test]
    fn test_mkdir_materializes_pending() {
        let (store, _provider) = tree_store();
        let user = tree_user();
        let mut handle = bound(
            &store,
            "/photos",
            Entry::Pending { parent: store.root(), name: "photos".to_string() },
            &user,
        );

        assert!(handle.mkdir());
        assert!(!handle.is_pending());
        assert!(handle.exists());
        assert!(handle.is_directory());
        assert_eq!(handle.link_count(), 3);

        // Second mkdir on an existing directory fails
        assert!(!handle.mkdir());
    }

    #[test]
    fn test_open_write_materializes_pending() {
        let (store, _provider) = tree_store();
        let user = tree_user();
        let mut handle = bound(
            &store,
            "/new.txt",
            Entry::Pending { parent: store.root(), name: "new.txt".to_string() },
            &user,
        );

        {
            let mut writer = handle.open_write(0).expect("Failed to open for write");
            writer.write_all(b"0123456789").expect("Failed to write");
        }

        assert!(!handle.is_pending());
        assert!(handle.exists());
        assert_eq!(handle.size(), 10);
        assert_eq!(read_all(&handle, 0), b"0123456789");
        assert_eq!(read_all(&handle, 7), b"789");
    }

    #[test]
    fn test_pending_nonzero_offset_fails_without_creating() {
        let (store, provider) = tree_store();
        let user = tree_user();
        let mut handle = bound(
            &store,
            "/new.txt",
            Entry::Pending { parent: store.root(), name: "new.txt".to_string() },
            &user,
        );

        let result = handle.open_write(5);
        assert!(matches!(result, Err(FsalError::Unsupported(_))));
        assert!(handle.is_pending());
        assert!(provider.lookup("new.txt").is_none());
    }

    #[test]
    fn test_non_random_access_offsets() {
        let (store, provider) = tree_store();
        let id = provider.insert("ten.bin", b"0123456789".to_vec()).expect("Failed to seed");
        let user = tree_user();
        let mut handle = bound(&store, "/ten.bin", Entry::Resolved(id), &user);

        let result = handle.open_write(5);
        assert!(matches!(result, Err(FsalError::Unsupported(_))));
        assert_eq!(handle.size(), 10, "Rejected write must not touch the file");

        {
            let mut writer = handle.open_write(10).expect("Append should succeed");
            writer.write_all(b"ab").expect("Failed to append");
        }
        assert_eq!(read_all(&handle, 0), b"0123456789ab");

        {
            let mut writer = handle.open_write(0).expect("Truncate should succeed");
            writer.write_all(b"xy").expect("Failed to write");
        }
        assert_eq!(read_all(&handle, 0), b"xy");
    }

    #[test]
    fn test_read_only_user() {
        let (store, provider) = tree_store();
        let id = provider.insert("a.txt", b"abc".to_vec()).expect("Failed to seed");
        let user = Arc::new(User::new("guest", StoreKind::DocumentTree).read_only());
        let mut handle = bound(&store, "/a.txt", Entry::Resolved(id), &user);

        assert!(handle.is_readable());
        assert!(!handle.is_writable());
        assert!(!handle.is_removable());
        assert!(!handle.delete());
        assert!(matches!(handle.open_write(0), Err(FsalError::PermissionDenied(_))));
    }

    #[test]
    fn test_delete() {
        let (store, provider) = tree_store();
        let id = provider.insert("a.txt", b"abc".to_vec()).expect("Failed to seed");
        let user = tree_user();
        let mut handle = bound(&store, "/a.txt", Entry::Resolved(id), &user);

        assert!(handle.is_removable());
        assert!(handle.delete());
        assert!(!handle.exists());
        assert!(!handle.delete(), "Deleting a missing entry fails");

        let mut root = bound(&store, "/", Entry::Resolved(store.root()), &user);
        assert!(!root.delete(), "Root is never removable");
        assert_eq!(root.name(), "/");
    }

    #[test]
    fn test_same_parent_move_is_rename() {
        let (store, provider) = tree_store();
        let id = provider.insert("a.txt", b"abc".to_vec()).expect("Failed to seed");
        let user = tree_user();
        let source = bound(&store, "/a.txt", Entry::Resolved(id), &user);
        let dest = bound(
            &store,
            "/b.txt",
            Entry::Pending { parent: store.root(), name: "b.txt".to_string() },
            &user,
        );

        assert!(source.move_to(&dest));
        assert!(provider.lookup("a.txt").is_none());
        let moved = provider.lookup("b.txt").expect("b.txt should exist");
        assert_eq!(provider.read(&moved).expect("Failed to read"), b"abc");
    }

    #[test]
    fn test_cross_parent_move_copies_then_deletes() {
        let (store, provider) = tree_store();
        let dir_a = provider.mkdirs("A").expect("Failed to create A");
        let dir_b = provider.mkdirs("B").expect("Failed to create B");
        let file = provider.insert("A/f.txt", b"payload".to_vec()).expect("Failed to seed");
        let user = tree_user();

        let source = bound(&store, "/A/f.txt", Entry::Resolved(file), &user);
        let dest = bound(
            &store,
            "/B/f.txt",
            Entry::Pending { parent: dir_b.clone(), name: "f.txt".to_string() },
            &user,
        );

        assert!(source.move_to(&dest));
        assert!(provider.children(&dir_a).is_empty());
        let moved = provider.lookup("B/f.txt").expect("File should be in B");
        assert_eq!(provider.read(&moved).expect("Failed to read"), b"payload");
    }

    #[test]
    fn test_cross_parent_move_rolls_back_on_copy_failure() {
        let (store, provider) = tree_store();
        let dir_b = provider.mkdirs("B").expect("Failed to create B");
        provider.mkdirs("A").expect("Failed to create A");
        let file = provider.insert("A/f.txt", vec![7u8; 4096]).expect("Failed to seed");
        let user = tree_user();

        let source = bound(&store, "/A/f.txt", Entry::Resolved(file.clone()), &user);
        let dest = bound(
            &store,
            "/B/f.txt",
            Entry::Pending { parent: dir_b.clone(), name: "f.txt".to_string() },
            &user,
        );

        provider.fail_writes_after(Some(100));
        assert!(!source.move_to(&dest));
        provider.fail_writes_after(None);

        assert!(provider.children(&dir_b).is_empty(), "No partial file may remain in B");
        assert_eq!(provider.read(&file).expect("Source must survive"), vec![7u8; 4096]);
    }

    #[test]
    fn test_cross_parent_move_of_directory() {
        let (store, provider) = tree_store();
        let dir = provider.mkdirs("A/sub").expect("Failed to create dirs");
        provider.insert("A/sub/x.txt", b"x".to_vec()).expect("Failed to seed");
        let dir_b = provider.mkdirs("B").expect("Failed to create B");
        let user = tree_user();

        let source = bound(&store, "/A/sub", Entry::Resolved(dir), &user);
        let dest = bound(
            &store,
            "/B/sub",
            Entry::Pending { parent: dir_b, name: "sub".to_string() },
            &user,
        );

        assert!(source.move_to(&dest));
        assert!(provider.lookup("A/sub").is_none());
        let moved = provider.lookup("B/sub/x.txt").expect("Nested file should move");
        assert_eq!(provider.read(&moved).expect("Failed to read"), b"x");
    }

    fn seed_nested(provider: &MemoryDocumentProvider) -> (DocumentId, DocumentId) {
        provider.mkdirs("A/sub/zz").expect("Failed to create dirs");
        provider.insert("A/sub/a.txt", b"a".to_vec()).expect("Failed to seed");
        provider.insert("A/sub/zz/y.txt", b"y".to_vec()).expect("Failed to seed");
        let dir_b = provider.mkdirs("B").expect("Failed to create B");
        let sub = provider.lookup("A/sub").expect("A/sub exists");
        (sub, dir_b)
    }

    fn move_sub(store: &Arc<DocumentTreeStore>, sub: DocumentId, dir_b: DocumentId) -> bool {
        let user = tree_user();
        let source = bound(store, "/A/sub", Entry::Resolved(sub), &user);
        let dest = bound(
            store,
            "/B/sub",
            Entry::Pending { parent: dir_b, name: "sub".to_string() },
            &user,
        );
        source.move_to(&dest)
    }

    #[test]
    fn test_directory_move_refused_when_source_not_removable() {
        let (store, provider) = tree_store();
        let (sub, dir_b) = seed_nested(&provider);
        let zz = provider.lookup("A/sub/zz").expect("zz exists");
        provider.set_writable(&zz, false);

        assert!(!move_sub(&store, sub, dir_b));
        assert!(provider.lookup("A/sub/a.txt").is_some(), "Source must be untouched");
        assert!(provider.lookup("A/sub/zz/y.txt").is_some());
        assert!(provider.lookup("B/sub").is_none(), "Nothing may be copied");
    }

    #[test]
    fn test_directory_move_keeps_copy_after_partial_delete() {
        let (store, provider) = tree_store();
        let (sub, dir_b) = seed_nested(&provider);
        provider.fail_delete_of("A/sub/zz/y.txt");

        assert!(!move_sub(&store, sub, dir_b));
        assert!(provider.lookup("A/sub/a.txt").is_none(), "First source entry was removed");
        assert!(provider.lookup("A/sub/zz/y.txt").is_some());

        let a = provider.lookup("B/sub/a.txt").expect("Copy must be kept");
        assert_eq!(provider.read(&a).expect("Failed to read"), b"a");
        let y = provider.lookup("B/sub/zz/y.txt").expect("Copy must be kept");
        assert_eq!(provider.read(&y).expect("Failed to read"), b"y");
    }

    #[test]
    fn test_directory_move_rolls_back_when_nothing_was_deleted() {
        let (store, provider) = tree_store();
        let (sub, dir_b) = seed_nested(&provider);
        provider.fail_delete_of("A/sub/a.txt");

        assert!(!move_sub(&store, sub, dir_b));
        assert!(provider.lookup("A/sub/a.txt").is_some());
        assert!(provider.lookup("A/sub/zz/y.txt").is_some());
        assert!(provider.lookup("B/sub").is_none(), "Copy is dropped while the source is whole");
    }

    #[test]
    fn test_failed_open_of_pending_file_leaves_nothing() {
        let (store, provider) = tree_store();
        let user = tree_user();
        let mut handle = bound(
            &store,
            "/new.txt",
            Entry::Pending { parent: store.root(), name: "new.txt".to_string() },
            &user,
        );
        provider.fail_write_open_of("new.txt");

        assert!(handle.open_write(0).is_err());
        assert!(handle.is_pending());
        assert!(provider.lookup("new.txt").is_none(), "Created file must be removed");
    }

    #[test]
    fn test_move_refusals() {
        let (store, provider) = tree_store();
        let a = provider.insert("a.txt", b"a".to_vec()).expect("Failed to seed");
        let b = provider.insert("b.txt", b"b".to_vec()).expect("Failed to seed");
        let dir = provider.mkdirs("d").expect("Failed to create dir");
        let user = tree_user();

        let source = bound(&store, "/a.txt", Entry::Resolved(a), &user);
        let existing = bound(&store, "/b.txt", Entry::Resolved(b), &user);
        assert!(!source.move_to(&existing), "Must not overwrite");

        let dir_handle = bound(&store, "/d", Entry::Resolved(dir.clone()), &user);
        let inside = bound(
            &store,
            "/d/d2",
            Entry::Pending { parent: dir, name: "d2".to_string() },
            &user,
        );
        assert!(!dir_handle.move_to(&inside), "Must not move into itself");

        let root = bound(&store, "/", Entry::Resolved(store.root()), &user);
        let target = bound(
            &store,
            "/r",
            Entry::Pending { parent: store.root(), name: "r".to_string() },
            &user,
        );
        assert!(!root.move_to(&target));
    }

    #[test]
    #[should_panic(expected = "returned to the pool")]
    fn test_cleared_handle_fails_loudly() {
        let (store, _provider) = tree_store();
        let user = tree_user();
        let mut handle = bound(&store, "/", Entry::Resolved(store.root()), &user);
        handle.clear();
        let _ = handle.exists();
    }

    #[test]
    fn test_local_random_access_write() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("f.bin"), b"0123456789").expect("Failed to write");
        let store = Arc::new(LocalStore::new(temp_dir.path()).expect("Failed to create store"));
        let user = Arc::new(User::new("bob", StoreKind::Local));
        let node = store.find_child(&store.root(), "f.bin").expect("lookup").expect("exists");
        let mut handle = bound(&store, "/f.bin", Entry::Resolved(node), &user);

        {
            let mut writer = handle.open_write(5).expect("Random access write");
            writer.write_all(b"XY").expect("Failed to write");
        }
        let data = fs::read(temp_dir.path().join("f.bin")).expect("Failed to read");
        assert_eq!(data, b"01234XY789");
    }

    #[test]
    fn test_local_cross_parent_move_is_native() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir(temp_dir.path().join("A")).expect("Failed to create A");
        fs::create_dir(temp_dir.path().join("B")).expect("Failed to create B");
        fs::write(temp_dir.path().join("A/f.txt"), b"abc").expect("Failed to write");
        let store = Arc::new(LocalStore::new(temp_dir.path()).expect("Failed to create store"));
        let user = Arc::new(User::new("bob", StoreKind::Local));

        let a = store.find_child(&store.root(), "A").expect("lookup").expect("A exists");
        let b = store.find_child(&store.root(), "B").expect("lookup").expect("B exists");
        let f = store.find_child(&a, "f.txt").expect("lookup").expect("f exists");

        let source = bound(&store, "/A/f.txt", Entry::Resolved(f), &user);
        let dest = bound(
            &store,
            "/B/g.txt",
            Entry::Pending { parent: b, name: "g.txt".to_string() },
            &user,
        );
        assert!(source.move_to(&dest));
        assert!(!temp_dir.path().join("A/f.txt").exists());
        assert_eq!(fs::read(temp_dir.path().join("B/g.txt")).expect("Failed to read"), b"abc");
    }
}
