use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation};

pub mod in_memory;

/// Unary RPCs used by transactions.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Datastore: Send + Sync + 'static {
    /// Reads the current backend state of `keys`, in request order. Missing
    /// documents come back as `NoDocument`s stamped with the read time.
    async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>>;

    /// Applies `mutations` atomically. Fails without applying anything when a
    /// precondition does not hold.
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<()>;
}

pub use in_memory::InMemoryDatastore;
