// Path Resolution
//
// Turns a client-supplied path plus the working directory into a canonical
// absolute path and a backing-store entry. Intermediate directories must
// exist; a missing final segment yields a create-pending entry.

use tracing::debug;

use super::handle::Entry;
use super::{BackingStore, FsalError, Result};

/// A resolved, existing location: canonical path plus store node
#[derive(Debug, Clone, PartialEq)]
pub struct Location<N> {
    pub path: String,
    pub node: N,
}

/// Outcome of resolving a requested path
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<N> {
    /// Canonical absolute path ("/" for the store root)
    pub path: String,
    pub entry: Entry<N>,
}

/// Path resolver over one backing store
pub struct PathResolver<'a, S: BackingStore> {
    store: &'a S,
}

impl<'a, S: BackingStore> PathResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Resolve `requested` against the working directory `cwd`
    ///
    /// Rules, in order:
    /// 1. a path starting with the store's root sentinel resolves from the root
    /// 2. an absolute path resolves from the root
    /// 3. `.` and `./` resolve to the working directory
    /// 4. anything else is appended to the working directory
    ///
    /// # Returns
    /// The canonical path and either a resolved node or a pending leaf.
    /// Fails when an intermediate segment is missing or not a directory.
    pub fn resolve(&self, cwd: &Location<S::Node>, requested: &str) -> Result<Resolution<S::Node>> {
        if requested.is_empty() {
            return Err(FsalError::InvalidPath("empty path".to_string()));
        }
        if requested.contains('\0') {
            return Err(FsalError::InvalidPath("path contains NUL".to_string()));
        }

        let mut segments = Vec::new();
        if let Some(rest) = self.strip_sentinel(requested) {
            push_segments(&mut segments, rest)?;
        } else if self.store.is_absolute(requested) {
            push_segments(&mut segments, requested)?;
        } else if requested == "." || requested == "./" {
            return Ok(Resolution {
                path: cwd.path.clone(),
                entry: Entry::Resolved(cwd.node.clone()),
            });
        } else {
            push_segments(&mut segments, &cwd.path)?;
            push_segments(&mut segments, requested)?;
        }

        let resolution = self.walk(cwd, &segments)?;
        debug!("RESOLVE: {:?} (cwd {}) -> {}", requested, cwd.path, resolution.path);
        Ok(resolution)
    }

    /// Strip the root sentinel if `requested` starts with it at a segment boundary
    fn strip_sentinel<'p>(&self, requested: &'p str) -> Option<&'p str> {
        let sentinel = self.store.root_sentinel().trim_end_matches('/');
        if sentinel.is_empty() {
            return None;
        }
        let rest = requested.strip_prefix(sentinel)?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    /// Walk normalized segments, starting from the working directory when it
    /// is a prefix of the target and from the root otherwise
    fn walk(&self, cwd: &Location<S::Node>, segments: &[String]) -> Result<Resolution<S::Node>> {
        let path = join_segments(segments);

        let mut cwd_segments = Vec::new();
        push_segments(&mut cwd_segments, &cwd.path)?;

        let (mut node, start) = if segments.starts_with(&cwd_segments) {
            (cwd.node.clone(), cwd_segments.len())
        } else {
            (self.store.root(), 0)
        };

        let remaining = &segments[start..];
        for (i, segment) in remaining.iter().enumerate() {
            let is_leaf = i + 1 == remaining.len();
            match self.store.find_child(&node, segment)? {
                Some(child) if is_leaf => {
                    return Ok(Resolution {
                        path,
                        entry: Entry::Resolved(child),
                    });
                }
                Some(child) => {
                    if !self.store.is_dir(&child) {
                        return Err(FsalError::NotADirectory(join_segments(&segments[..=start + i])));
                    }
                    node = child;
                }
                None if is_leaf => {
                    return Ok(Resolution {
                        path,
                        entry: Entry::Pending {
                            parent: node,
                            name: segment.clone(),
                        },
                    });
                }
                None => {
                    return Err(FsalError::NotFound(join_segments(&segments[..=start + i])));
                }
            }
        }

        Ok(Resolution {
            path,
            entry: Entry::Resolved(node),
        })
    }
}

/// Append the segments of `path` onto `stack`
///
/// Leading and trailing separators are ignored, `.` is skipped and `..` pops
/// (never above the root). Empty segments are rejected.
pub fn push_segments(stack: &mut Vec<String>, path: &str) -> Result<()> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(());
    }

    for segment in trimmed.split('/') {
        match segment {
            "" => {
                return Err(FsalError::InvalidPath(format!("empty segment in {:?}", path)));
            }
            "." => {}
            ".." => {
                stack.pop();
            }
            name => stack.push(name.to_string()),
        }
    }

    Ok(())
}

/// Canonical absolute path for a list of segments
pub fn join_segments(segments: &[String]) -> String {
    format!("/{}", segments.join("/"))
}

/// Absolute path of `name` inside the directory at `dir`
pub fn child_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsal::{DocumentTreeStore, LocalStore, MemoryDocumentProvider};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn segments(path: &str) -> Result<Vec<String>> {
        let mut stack = Vec::new();
        push_segments(&mut stack, path)?;
        Ok(stack)
    }

    fn create_tree() -> (DocumentTreeStore, Arc<MemoryDocumentProvider>) {
        let provider = Arc::new(MemoryDocumentProvider::new("primary:"));
        provider.mkdirs("docs/notes").expect("Failed to seed dirs");
        provider.insert("docs/readme.txt", b"hello".to_vec()).expect("Failed to seed file");
        (DocumentTreeStore::new(provider.clone()), provider)
    }

    fn root_location<S: BackingStore>(store: &S) -> Location<S::Node> {
        Location {
            path: "/".to_string(),
            node: store.root(),
        }
    }

    #[test]
    fn test_push_segments() {
        assert_eq!(segments("/a/b/").unwrap(), vec!["a", "b"]);
        assert_eq!(segments("a/./b").unwrap(), vec!["a", "b"]);
        assert_eq!(segments("a/../b").unwrap(), vec!["b"]);
        assert_eq!(segments("/../..").unwrap(), Vec::<String>::new());
        assert!(segments("/").unwrap().is_empty());
        assert!(matches!(segments("a//b"), Err(FsalError::InvalidPath(_))));
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
    }

    #[test]
    fn test_resolve_existing_relative_and_absolute() {
        let (store, _provider) = create_tree();
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);

        let relative = resolver.resolve(&root, "docs/readme.txt").expect("Failed to resolve");
        let absolute = resolver.resolve(&root, "/docs/readme.txt").expect("Failed to resolve");

        assert_eq!(relative.path, "/docs/readme.txt");
        assert_eq!(relative, absolute);
        assert!(matches!(relative.entry, Entry::Resolved(_)));
    }

    #[test]
    fn test_resolve_missing_leaf_is_pending() {
        let (store, _provider) = create_tree();
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);

        let res = resolver.resolve(&root, "docs/new.txt").expect("Failed to resolve");
        assert_eq!(res.path, "/docs/new.txt");
        match res.entry {
            Entry::Pending { parent, name } => {
                assert_eq!(name, "new.txt");
                assert_eq!(store.name(&parent), "docs");
            }
            Entry::Resolved(_) => panic!("Expected pending entry"),
        }
    }

    #[test]
    fn test_resolve_missing_intermediate_fails() {
        let (store, _provider) = create_tree();
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);

        let result = resolver.resolve(&root, "missingDir/whatever.txt");
        assert!(matches!(result, Err(FsalError::NotFound(ref p)) if p == "/missingDir"));
    }

    #[test]
    fn test_resolve_through_file_fails() {
        let (store, _provider) = create_tree();
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);

        let result = resolver.resolve(&root, "docs/readme.txt/x");
        assert!(matches!(result, Err(FsalError::NotADirectory(_))));
    }

    #[test]
    fn test_resolve_dot_is_cwd() {
        let (store, _provider) = create_tree();
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);
        let docs = resolver.resolve(&root, "/docs").expect("Failed to resolve");
        let cwd = match docs.entry {
            Entry::Resolved(node) => Location { path: docs.path, node },
            Entry::Pending { .. } => panic!("docs should exist"),
        };

        for dot in [".", "./"] {
            let res = resolver.resolve(&cwd, dot).expect("Failed to resolve dot");
            assert_eq!(res.path, "/docs");
            assert_eq!(res.entry, Entry::Resolved(cwd.node.clone()));
        }

        let parent = resolver.resolve(&cwd, "..").expect("Failed to resolve parent");
        assert_eq!(parent.path, "/");
        assert_eq!(parent.entry, Entry::Resolved(store.root()));

        let nested = resolver.resolve(&cwd, "notes").expect("Failed to resolve nested");
        assert_eq!(nested.path, "/docs/notes");
    }

    #[test]
    fn test_resolve_root_sentinel() {
        let (store, _provider) = create_tree();
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);

        let res = resolver.resolve(&root, "primary:/docs/readme.txt").expect("Failed to resolve");
        assert_eq!(res.path, "/docs/readme.txt");

        let res = resolver.resolve(&root, "primary:").expect("Failed to resolve root");
        assert_eq!(res.path, "/");
        assert_eq!(res.entry, Entry::Resolved(store.root()));

        // Sentinel must end at a segment boundary
        let res = resolver.resolve(&root, "primary:x").expect("Failed to resolve");
        assert!(matches!(res.entry, Entry::Pending { .. }));
        assert_eq!(res.path, "/primary:x");
    }

    #[test]
    fn test_resolve_rejects_malformed() {
        let (store, _provider) = create_tree();
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);

        assert!(matches!(resolver.resolve(&root, ""), Err(FsalError::InvalidPath(_))));
        assert!(matches!(resolver.resolve(&root, "docs//x"), Err(FsalError::InvalidPath(_))));
    }

    #[test]
    fn test_resolve_local_store() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir(temp_dir.path().join("pub")).expect("Failed to create dir");
        fs::write(temp_dir.path().join("pub/a.txt"), b"abc").expect("Failed to write");
        let store = LocalStore::new(temp_dir.path()).expect("Failed to create store");
        let resolver = PathResolver::new(&store);
        let root = root_location(&store);

        let res = resolver.resolve(&root, "/pub/a.txt").expect("Failed to resolve");
        assert!(matches!(res.entry, Entry::Resolved(_)));

        let dotted = resolver.resolve(&root, "/pub/./a.txt").expect("Failed to resolve");
        assert_eq!(dotted, res);
    }

    #[test]
    fn test_local_paths_mirroring_the_export_root() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStore::new(temp_dir.path()).expect("Failed to create store");

        // A directory tree inside the export that repeats the export's own path
        let native = store.root_path().display().to_string();
        let mirror = store.root_path().join(native.trim_start_matches('/'));
        fs::create_dir_all(&mirror).expect("Failed to create mirror dirs");
        fs::write(mirror.join("f.txt"), b"x").expect("Failed to write");

        let resolver = PathResolver::new(&store);
        let root = root_location(&store);
        let requested = format!("{}/f.txt", native);
        let res = resolver.resolve(&root, &requested).expect("Failed to resolve");

        assert_eq!(res.path, requested);
        assert_eq!(res.entry, Entry::Resolved(mirror.join("f.txt")));
    }
}
