// Server Configuration
//
// Settings come from FSAL_* environment variables. Misconfiguration is
// reported before any store or view is built.

use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::fsal::{BackendConfig, DocumentProvider, MemoryDocumentProvider, StoreKind, User};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:2121";
pub const DEFAULT_TREE_LABEL: &str = "primary:";

/// Runtime configuration for the console server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Console listen address
    pub listen: String,
    /// Export root of the local store
    pub local_root: Option<PathBuf>,
    /// Root label of the in-memory provider tree
    pub tree_label: Option<String>,
    /// Users allowed to open a session
    pub users: Vec<User>,
    /// Idle views kept per store kind
    pub max_pooled_views: usize,
}

impl ServerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Arguments
    /// * `lookup` - Returns the value of a variable, or None if unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = lookup("FSAL_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());

        let local_root = lookup("FSAL_LOCAL_ROOT")
            .filter(|root| !root.is_empty())
            .map(PathBuf::from);

        let tree_label = lookup("FSAL_TREE_LABEL").map(|label| {
            if label.is_empty() {
                DEFAULT_TREE_LABEL.to_string()
            } else {
                label
            }
        });

        if local_root.is_none() && tree_label.is_none() {
            bail!("no backend configured: set FSAL_LOCAL_ROOT and/or FSAL_TREE_LABEL");
        }

        let max_pooled_views = match lookup("FSAL_MAX_POOLED_VIEWS") {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("invalid FSAL_MAX_POOLED_VIEWS {:?}", value))?,
            None => BackendConfig::DEFAULT_MAX_POOLED_VIEWS,
        };

        let users = match lookup("FSAL_USERS") {
            Some(list) => parse_users(&list)?,
            None => {
                let storage = if local_root.is_some() {
                    StoreKind::Local
                } else {
                    StoreKind::DocumentTree
                };
                vec![User::new("anonymous", storage)]
            }
        };

        for user in &users {
            let configured = match user.storage {
                StoreKind::Local => local_root.is_some(),
                StoreKind::DocumentTree => tree_label.is_some(),
            };
            if !configured {
                bail!("user {} is routed to the {} store, which is not configured", user.name, user.storage);
            }
        }

        Ok(Self {
            listen,
            local_root,
            tree_label,
            users,
            max_pooled_views,
        })
    }

    /// Backend configuration for the stores this server exposes
    ///
    /// The provider tree is an in-memory one labelled with `tree_label`.
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            local_root: self.local_root.clone(),
            document_tree: self
                .tree_label
                .as_ref()
                .map(|label| Arc::new(MemoryDocumentProvider::new(label.clone())) as Arc<dyn DocumentProvider>),
            max_pooled_views: self.max_pooled_views,
        }
    }

    /// Look up a configured user by name
    pub fn user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|user| user.name == name)
    }
}

/// Parse a comma-separated `name:storage:home:perm` list
///
/// `storage` is `local` or `tree`, `perm` is `rw` or `ro`. Trailing fields
/// may be omitted (home defaults to `/`, perm to `rw`).
pub fn parse_users(list: &str) -> Result<Vec<User>> {
    let mut users = Vec::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut fields = entry.split(':');
        let name = fields.next().unwrap_or_default();
        if name.is_empty() {
            bail!("user entry {:?} has no name", entry);
        }

        let storage = match fields.next() {
            Some("local") => StoreKind::Local,
            Some("tree") => StoreKind::DocumentTree,
            Some(other) => bail!("user {}: unknown storage {:?}", name, other),
            None => bail!("user {}: missing storage", name),
        };

        let mut user = User::new(name, storage);
        if let Some(home) = fields.next().filter(|h| !h.is_empty()) {
            if !home.starts_with('/') {
                bail!("user {}: home {:?} must be absolute", name, home);
            }
            user = user.with_home(home);
        }

        match fields.next() {
            None | Some("rw") => {}
            Some("ro") => user = user.read_only(),
            Some(other) => bail!("user {}: unknown permission {:?}", name, other),
        }

        if let Some(extra) = fields.next() {
            return Err(anyhow!("user {}: unexpected field {:?}", name, extra));
        }
        if users.iter().any(|u: &User| u.name == name) {
            bail!("user {} defined twice", name);
        }
        users.push(user);
    }

    if users.is_empty() {
        bail!("FSAL_USERS defines no users");
    }
    Ok(users)
}
