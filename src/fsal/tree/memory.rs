// In-Memory Document Provider
//
// A provider tree kept in process memory. Document ids follow the
// "<label><relative/path>" convention of storage providers, so the parent of
// a document can be derived from its id even after the document is gone.
// Write failures can be injected to exercise rollback paths.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{DocumentId, DocumentProvider};

#[derive(Debug, Clone)]
enum Content {
    Directory,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Document {
    content: Content,
    mime_type: Option<String>,
    modified: SystemTime,
    writable: bool,
}

impl Document {
    fn directory() -> Self {
        Self {
            content: Content::Directory,
            mime_type: None,
            modified: SystemTime::now(),
            writable: true,
        }
    }

    fn file(mime_type: &str, data: Vec<u8>) -> Self {
        Self {
            content: Content::File(data),
            mime_type: Some(mime_type.to_string()),
            modified: SystemTime::now(),
            writable: true,
        }
    }

    fn is_directory(&self) -> bool {
        matches!(self.content, Content::Directory)
    }
}

/// Documents keyed by path relative to the tree root ("" is the root)
type Documents = BTreeMap<String, Document>;

/// In-memory provider tree
///
/// Cloning shares the same tree.
#[derive(Clone)]
pub struct MemoryDocumentProvider {
    label: String,
    documents: Arc<RwLock<Documents>>,
    /// Byte budget for writes, `None` for unlimited
    write_budget: Arc<Mutex<Option<u64>>>,
    faults: Arc<Mutex<Faults>>,
}

/// Paths whose operations fail on purpose
#[derive(Default)]
struct Faults {
    deletes: HashSet<String>,
    write_opens: HashSet<String>,
}

impl MemoryDocumentProvider {
    /// Create an empty tree whose ids start with `label` (e.g. "primary:")
    pub fn new(label: impl Into<String>) -> Self {
        let mut documents = Documents::new();
        documents.insert(String::new(), Document::directory());
        Self {
            label: label.into(),
            documents: Arc::new(RwLock::new(documents)),
            write_budget: Arc::new(Mutex::new(None)),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Create every missing directory along `path`
    pub fn mkdirs(&self, path: &str) -> io::Result<DocumentId> {
        let mut documents = self.documents.write();
        let mut rel = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            rel = join(&rel, segment);
            match documents.get(&rel) {
                Some(doc) if doc.is_directory() => {}
                Some(_) => return Err(not_a_directory(&rel)),
                None => {
                    documents.insert(rel.clone(), Document::directory());
                }
            }
        }
        Ok(self.id(&rel))
    }

    /// Store a file at `path`, creating parent directories as needed
    pub fn insert(&self, path: &str, data: Vec<u8>) -> io::Result<DocumentId> {
        let path = path.trim_matches('/');
        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        self.mkdirs(parent)?;

        let rel = join(parent.trim_matches('/'), name);
        let mut documents = self.documents.write();
        if documents.get(&rel).is_some_and(Document::is_directory) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("{} is a directory", rel)));
        }
        documents.insert(rel.clone(), Document::file(super::mime_type_for(name), data));
        Ok(self.id(&rel))
    }

    /// Id of the document at `path`, if it exists
    pub fn lookup(&self, path: &str) -> Option<DocumentId> {
        let rel = path.trim_matches('/');
        self.documents.read().contains_key(rel).then(|| self.id(rel))
    }

    /// Full contents of a file
    pub fn read(&self, id: &DocumentId) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open_read(id)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Children of a directory (empty for anything else)
    pub fn children(&self, id: &DocumentId) -> Vec<DocumentId> {
        self.list_children(id).unwrap_or_default()
    }

    /// MIME type recorded when the file was created
    pub fn mime_type(&self, id: &DocumentId) -> Option<String> {
        let rel = self.rel(id)?;
        self.documents.read().get(rel).and_then(|doc| doc.mime_type.clone())
    }

    /// Grant or revoke write access to a single document
    pub fn set_writable(&self, id: &DocumentId, writable: bool) {
        if let Some(rel) = self.rel(id) {
            if let Some(doc) = self.documents.write().get_mut(rel) {
                doc.writable = writable;
            }
        }
    }

    /// Make writes fail once `budget` bytes have been written
    pub fn fail_writes_after(&self, budget: Option<u64>) {
        *self.write_budget.lock() = budget;
    }

    /// Make every delete of `path` fail
    pub fn fail_delete_of(&self, path: &str) {
        self.faults.lock().deletes.insert(path.trim_matches('/').to_string());
    }

    /// Make every open for writing of `path` fail
    pub fn fail_write_open_of(&self, path: &str) {
        self.faults.lock().write_opens.insert(path.trim_matches('/').to_string());
    }

    fn id(&self, rel: &str) -> DocumentId {
        DocumentId(format!("{}{}", self.label, rel))
    }

    fn rel<'a>(&self, id: &'a DocumentId) -> Option<&'a str> {
        id.0.strip_prefix(&self.label)
    }

    fn rel_or_not_found<'a>(&self, id: &'a DocumentId) -> io::Result<&'a str> {
        self.rel(id).ok_or_else(|| not_found(&id.0))
    }

    fn with_document<T>(&self, id: &DocumentId, f: impl FnOnce(&Document) -> T) -> Option<T> {
        let rel = self.rel(id)?;
        self.documents.read().get(rel).map(f)
    }

    /// Check that `rel` is a writable directory
    fn writable_directory(documents: &Documents, rel: &str) -> io::Result<()> {
        match documents.get(rel) {
            Some(doc) if !doc.is_directory() => Err(not_a_directory(rel)),
            Some(doc) if !doc.writable => Err(permission_denied(rel)),
            Some(_) => Ok(()),
            None => Err(not_found(rel)),
        }
    }

    fn create(&self, parent: &DocumentId, name: &str, document: Document) -> io::Result<DocumentId> {
        validate_name(name)?;
        let parent_rel = self.rel_or_not_found(parent)?;
        let mut documents = self.documents.write();
        Self::writable_directory(&documents, parent_rel)?;

        let rel = join(parent_rel, name);
        if documents.contains_key(&rel) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, rel));
        }
        documents.insert(rel.clone(), document);
        trace!("memory provider: created {}", rel);
        Ok(self.id(&rel))
    }
}

impl DocumentProvider for MemoryDocumentProvider {
    fn root(&self) -> DocumentId {
        self.id("")
    }

    fn root_label(&self) -> &str {
        &self.label
    }

    fn exists(&self, id: &DocumentId) -> bool {
        self.with_document(id, |_| ()).is_some()
    }

    fn is_directory(&self, id: &DocumentId) -> bool {
        self.with_document(id, Document::is_directory).unwrap_or(false)
    }

    fn is_file(&self, id: &DocumentId) -> bool {
        self.with_document(id, |doc| !doc.is_directory()).unwrap_or(false)
    }

    fn can_read(&self, id: &DocumentId) -> bool {
        self.exists(id)
    }

    fn can_write(&self, id: &DocumentId) -> bool {
        self.with_document(id, |doc| doc.writable).unwrap_or(false)
    }

    fn length(&self, id: &DocumentId) -> u64 {
        self.with_document(id, |doc| match &doc.content {
            Content::File(data) => data.len() as u64,
            Content::Directory => 0,
        })
        .unwrap_or(0)
    }

    fn last_modified(&self, id: &DocumentId) -> Option<SystemTime> {
        self.with_document(id, |doc| doc.modified)
    }

    fn display_name(&self, id: &DocumentId) -> Option<String> {
        let rel = self.rel(id)?;
        if rel.is_empty() {
            return Some(self.label.clone());
        }
        Some(rel.rsplit('/').next().unwrap_or(rel).to_string())
    }

    fn parent(&self, id: &DocumentId) -> Option<DocumentId> {
        let rel = self.rel(id)?;
        if rel.is_empty() {
            return None;
        }
        let parent = rel.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
        Some(self.id(parent))
    }

    fn find_child(&self, parent: &DocumentId, name: &str) -> io::Result<Option<DocumentId>> {
        let parent_rel = self.rel_or_not_found(parent)?;
        let documents = self.documents.read();
        match documents.get(parent_rel) {
            Some(doc) if doc.is_directory() => {}
            Some(_) => return Err(not_a_directory(parent_rel)),
            None => return Err(not_found(parent_rel)),
        }
        let rel = join(parent_rel, name);
        Ok(documents.contains_key(&rel).then(|| self.id(&rel)))
    }

    fn list_children(&self, parent: &DocumentId) -> io::Result<Vec<DocumentId>> {
        let parent_rel = self.rel_or_not_found(parent)?;
        let documents = self.documents.read();
        match documents.get(parent_rel) {
            Some(doc) if doc.is_directory() => {}
            Some(_) => return Err(not_a_directory(parent_rel)),
            None => return Err(not_found(parent_rel)),
        }

        let prefix = if parent_rel.is_empty() {
            String::new()
        } else {
            format!("{}/", parent_rel)
        };
        let mut children: Vec<&String> = documents
            .keys()
            .filter(|key| !key.is_empty())
            .filter(|key| {
                key.strip_prefix(prefix.as_str())
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .collect();
        children.sort();
        Ok(children.into_iter().map(|rel| self.id(rel)).collect())
    }

    fn create_file(&self, parent: &DocumentId, mime_type: &str, name: &str) -> io::Result<DocumentId> {
        self.create(parent, name, Document::file(mime_type, Vec::new()))
    }

    fn create_directory(&self, parent: &DocumentId, name: &str) -> io::Result<DocumentId> {
        self.create(parent, name, Document::directory())
    }

    fn delete(&self, id: &DocumentId) -> io::Result<()> {
        let rel = self.rel_or_not_found(id)?;
        if rel.is_empty() {
            return Err(permission_denied("tree root"));
        }
        let parent_rel = rel.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");

        let mut documents = self.documents.write();
        if !documents.contains_key(rel) {
            return Err(not_found(rel));
        }
        Self::writable_directory(&documents, parent_rel)?;
        if self.faults.lock().deletes.contains(rel) {
            return Err(io::Error::other("injected delete failure"));
        }

        let descendants = format!("{}/", rel);
        documents.retain(|key, _| key != rel && !key.starts_with(&descendants));
        trace!("memory provider: deleted {}", rel);
        Ok(())
    }

    fn rename(&self, id: &DocumentId, name: &str) -> io::Result<DocumentId> {
        validate_name(name)?;
        let rel = self.rel_or_not_found(id)?;
        if rel.is_empty() {
            return Err(permission_denied("tree root"));
        }
        let parent_rel = rel.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
        let new_rel = join(parent_rel, name);

        let mut documents = self.documents.write();
        if !documents.contains_key(rel) {
            return Err(not_found(rel));
        }
        Self::writable_directory(&documents, parent_rel)?;
        if documents.contains_key(&new_rel) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, new_rel));
        }

        let descendants = format!("{}/", rel);
        let moved: Vec<String> = documents
            .keys()
            .filter(|key| key.as_str() == rel || key.starts_with(&descendants))
            .cloned()
            .collect();
        for old in moved {
            if let Some(doc) = documents.remove(&old) {
                let new_key = format!("{}{}", new_rel, &old[rel.len()..]);
                documents.insert(new_key, doc);
            }
        }
        trace!("memory provider: renamed {} -> {}", rel, new_rel);
        Ok(self.id(&new_rel))
    }

    fn open_read(&self, id: &DocumentId) -> io::Result<Box<dyn Read + Send>> {
        let rel = self.rel_or_not_found(id)?;
        let documents = self.documents.read();
        match documents.get(rel).map(|doc| &doc.content) {
            Some(Content::File(data)) => Ok(Box::new(Cursor::new(data.clone()))),
            Some(Content::Directory) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", rel),
            )),
            None => Err(not_found(rel)),
        }
    }

    fn open_write(&self, id: &DocumentId, append: bool) -> io::Result<Box<dyn Write + Send>> {
        let rel = self.rel_or_not_found(id)?;
        if self.faults.lock().write_opens.contains(rel) {
            return Err(io::Error::other("injected open failure"));
        }
        let mut documents = self.documents.write();
        let doc = documents.get_mut(rel).ok_or_else(|| not_found(rel))?;
        if !doc.writable {
            return Err(permission_denied(rel));
        }
        match &mut doc.content {
            Content::File(data) => {
                if !append {
                    data.clear();
                }
            }
            Content::Directory => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a directory", rel),
                ));
            }
        }
        doc.modified = SystemTime::now();

        Ok(Box::new(MemoryWriter {
            rel: rel.to_string(),
            documents: self.documents.clone(),
            write_budget: self.write_budget.clone(),
            written: 0,
        }))
    }
}

/// Output stream appending straight into a document
struct MemoryWriter {
    rel: String,
    documents: Arc<RwLock<Documents>>,
    write_budget: Arc<Mutex<Option<u64>>>,
    written: u64,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut len = buf.len();
        if let Some(budget) = *self.write_budget.lock() {
            if self.written >= budget {
                return Err(io::Error::other("injected write failure"));
            }
            len = len.min((budget - self.written) as usize);
        }

        let mut documents = self.documents.write();
        match documents.get_mut(&self.rel) {
            Some(Document { content: Content::File(data), modified, .. }) => {
                data.extend_from_slice(&buf[..len]);
                *modified = SystemTime::now();
            }
            _ => return Err(not_found(&self.rel)),
        }
        self.written += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn validate_name(name: &str) -> io::Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid name: {:?}", name)));
    }
    Ok(())
}

fn not_found(rel: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no document {:?}", rel))
}

fn not_a_directory(rel: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{:?} is not a directory", rel))
}

fn permission_denied(rel: &str) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, format!("{:?} is read-only", rel))
}
