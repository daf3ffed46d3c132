//! In-memory file-store catalog backing `FileService`. Per the
//! concurrency model, the only persisted state is the credential/
//! rate-limit store — store and file metadata here live for the process
//! lifetime; the actual bytes are handed off to the external indexing
//! pipeline, and temp artifacts are cleaned up via `files::discard`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct StoreRecord {
    pub store_id: String,
    pub tenant_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub store_id: String,
    pub tenant_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

#[derive(Default)]
struct Inner {
    stores: HashMap<String, StoreRecord>,
    files: HashMap<String, FileRecord>,
}

#[derive(Default)]
pub struct FileCatalog {
    inner: RwLock<Inner>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_store(&self, tenant_id: &str, name: &str) -> String {
        let store_id = Uuid::new_v4().to_string();
        let mut inner = self.inner.write().expect("catalog lock poisoned");
        inner.stores.insert(
            store_id.clone(),
            StoreRecord {
                store_id: store_id.clone(),
                tenant_id: tenant_id.to_string(),
                name: name.to_string(),
            },
        );
        store_id
    }

    /// Register a file that has already been written to `path`.
    pub fn put_file(
        &self,
        tenant_id: &str,
        store_id: &str,
        filename: &str,
        mime_type: &str,
        size_bytes: u64,
        path: PathBuf,
    ) -> Result<String> {
        let mut inner = self.inner.write().expect("catalog lock poisoned");
        let store = inner
            .stores
            .get(store_id)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown store '{store_id}'")))?;
        if store.tenant_id != tenant_id {
            return Err(GatewayError::PermissionDenied("store belongs to a different tenant".into()));
        }

        let file_id = Uuid::new_v4().to_string();
        inner.files.insert(
            file_id.clone(),
            FileRecord {
                file_id: file_id.clone(),
                store_id: store_id.to_string(),
                tenant_id: tenant_id.to_string(),
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
                size_bytes,
                created_at: Utc::now(),
                path,
            },
        );
        Ok(file_id)
    }

    pub fn get_file(&self, tenant_id: &str, file_id: &str) -> Result<FileRecord> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        let file = inner
            .files
            .get(file_id)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown file '{file_id}'")))?;
        if file.tenant_id != tenant_id {
            return Err(GatewayError::NotFound(format!("unknown file '{file_id}'")));
        }
        Ok(file.clone())
    }

    /// Removes and returns the record so the caller can discard its
    /// on-disk artifact; returns `Ok(None)` if it never existed or
    /// belongs to a different tenant (never leaks cross-tenant existence).
    pub fn remove_file(&self, tenant_id: &str, file_id: &str) -> Option<FileRecord> {
        let mut inner = self.inner.write().expect("catalog lock poisoned");
        match inner.files.get(file_id) {
            Some(f) if f.tenant_id == tenant_id => inner.files.remove(file_id),
            _ => None,
        }
    }

    pub fn list_files(&self, tenant_id: &str, store_id: &str) -> Vec<FileRecord> {
        let inner = self.inner.read().expect("catalog lock poisoned");
        inner
            .files
            .values()
            .filter(|f| f.tenant_id == tenant_id && f.store_id == store_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_file_rejects_cross_tenant_store() {
        let catalog = FileCatalog::new();
        let store_id = catalog.create_store("acme", "docs");
        let err = catalog
            .put_file("globex", &store_id, "f.txt", "text/plain", 10, PathBuf::from("/tmp/x"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
    }

    #[test]
    fn get_file_hides_cross_tenant_records() {
        let catalog = FileCatalog::new();
        let store_id = catalog.create_store("acme", "docs");
        let file_id = catalog
            .put_file("acme", &store_id, "f.txt", "text/plain", 10, PathBuf::from("/tmp/x"))
            .unwrap();
        assert!(catalog.get_file("globex", &file_id).is_err());
        assert!(catalog.get_file("acme", &file_id).is_ok());
    }

    #[test]
    fn list_files_scopes_to_tenant_and_store() {
        let catalog = FileCatalog::new();
        let store_a = catalog.create_store("acme", "docs");
        let store_b = catalog.create_store("acme", "other");
        catalog
            .put_file("acme", &store_a, "a.txt", "text/plain", 1, PathBuf::from("/tmp/a"))
            .unwrap();
        catalog
            .put_file("acme", &store_b, "b.txt", "text/plain", 1, PathBuf::from("/tmp/b"))
            .unwrap();
        assert_eq!(catalog.list_files("acme", &store_a).len(), 1);
        assert_eq!(catalog.list_files("acme", &store_b).len(), 1);
    }

    #[test]
    fn remove_file_is_tenant_scoped() {
        let catalog = FileCatalog::new();
        let store_id = catalog.create_store("acme", "docs");
        let file_id = catalog
            .put_file("acme", &store_id, "f.txt", "text/plain", 1, PathBuf::from("/tmp/x"))
            .unwrap();
        assert!(catalog.remove_file("globex", &file_id).is_none());
        assert!(catalog.remove_file("acme", &file_id).is_some());
        assert!(catalog.get_file("acme", &file_id).is_err());
    }
}
