//! Seams to the remote collaborators: the record store and the identity
//! provider.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::{CurrentUser, RecordRef, StoreError, StoredRecord};

/// A document store exposing collection-scoped CRUD over opaque handles.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read every record in `collection`, in store order.
    async fn list(&self, collection: &str) -> Result<Vec<StoredRecord>, StoreError>;

    /// Create a new record and return it with its freshly assigned handle.
    async fn create(&self, collection: &str, record: &Value) -> Result<StoredRecord, StoreError>;

    /// Replace the whole body of the record at `handle`.
    async fn replace(&self, handle: &RecordRef, record: &Value)
    -> Result<StoredRecord, StoreError>;

    /// Delete the record at `handle`.
    async fn delete(&self, handle: &RecordRef) -> Result<(), StoreError>;
}

/// Sign-in collaborator used to stamp authorship on new ideas.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Start a session and return the signed-in user.
    async fn sign_in(&self, identifier: &str, password: &str) -> Result<CurrentUser, StoreError>;

    /// End the current session. A no-op when nobody is signed in.
    async fn sign_out(&self) -> Result<(), StoreError>;

    /// Permanently delete the signed-in account.
    async fn delete_account(&self, password: &str, token: &str) -> Result<(), StoreError>;

    /// Stream of the signed-in user; `None` while signed out.
    fn current_user(&self) -> watch::Receiver<Option<CurrentUser>>;
}
