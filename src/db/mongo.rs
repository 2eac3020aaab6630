//! MongoDB access
//!
//! `MongoClient` owns the connection; `MongoCollection<T>` is a typed handle
//! that syncs its schema indexes when opened. State changes go through
//! `update_where`: the filter carries the expected state, so a zero match
//! count means the precondition no longer holds.

use std::time::Duration;

use bson::{doc, DateTime, Document};
use futures::stream::TryStreamExt;
use mongodb::{
    error::Error as MongoError,
    options::{ClientOptions, IndexOptions},
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::db::schemas::Metadata;
use crate::types::HandoffError;

const SELECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Index definitions a schema wants on its collection
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Access to a schema's storage bookkeeping
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// Wraps a driver error with the operation that produced it
fn db_err(op: &'static str) -> impl FnOnce(MongoError) -> HandoffError {
    move |e| HandoffError::Database(format!("{op}: {e}"))
}

/// Adds the write stamp to an update document's `$set` stage
fn stamp(mut update: Document) -> Document {
    const FIELD: &str = "metadata.written_at";
    let now = DateTime::now();
    if !update.contains_key("$set") {
        update.insert("$set", Document::new());
    }
    if let Ok(set) = update.get_document_mut("$set") {
        set.insert(FIELD, now);
    }
    update
}

#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and ping. Server selection is capped so an unreachable
    /// server fails startup quickly.
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, HandoffError> {
        info!(uri, db = db_name, "Connecting to MongoDB");

        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(db_err("invalid MongoDB URI"))?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        options.server_selection_timeout = Some(SELECT_TIMEOUT);
        options.connect_timeout = Some(SELECT_TIMEOUT);

        let client = Client::with_options(options).map_err(db_err("MongoDB client"))?;
        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(db_err("MongoDB ping"))?;

        info!(db = db_name, "MongoDB reachable");
        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Open a typed collection, creating its indexes if missing
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>, HandoffError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        let handle = MongoCollection {
            inner: self.client.database(&self.db_name).collection::<T>(name),
        };
        handle.sync_indexes().await?;
        Ok(handle)
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
{
    async fn sync_indexes(&self) -> Result<(), HandoffError> {
        let models: Vec<IndexModel> = T::into_indices()
            .into_iter()
            .map(|(keys, options)| IndexModel::builder().keys(keys).options(options).build())
            .collect();
        if models.is_empty() {
            return Ok(());
        }

        let count = models.len();
        self.inner
            .create_indexes(models)
            .await
            .map_err(db_err("index creation"))?;
        debug!(collection = self.inner.name(), count, "Indexes in place");
        Ok(())
    }

    pub async fn insert_one(&self, mut item: T) -> Result<(), HandoffError> {
        item.mut_metadata().stamp_insert();
        self.inner
            .insert_one(item)
            .await
            .map_err(db_err("insert"))?;
        Ok(())
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, HandoffError> {
        self.inner.find_one(filter).await.map_err(db_err("find"))
    }

    /// One sorted page. A document that fails to decode fails the read.
    pub async fn find_page(
        &self,
        filter: Document,
        sort: Document,
        skip: u64,
        limit: i64,
    ) -> Result<Vec<T>, HandoffError> {
        self.inner
            .find(filter)
            .sort(sort)
            .skip(skip)
            .limit(limit)
            .await
            .map_err(db_err("find"))?
            .try_collect()
            .await
            .map_err(db_err("cursor"))
    }

    pub async fn count(&self, filter: Document) -> Result<u64, HandoffError> {
        self.inner
            .count_documents(filter)
            .await
            .map_err(db_err("count"))
    }

    /// Apply `update` to the one document still matching `filter`.
    /// Returns false when nothing matched.
    pub async fn update_where(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<bool, HandoffError> {
        let outcome = self
            .inner
            .update_one(filter, stamp(update))
            .await
            .map_err(db_err("update"))?;
        Ok(outcome.matched_count > 0)
    }

    /// Returns the number of documents actually changed
    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<u64, HandoffError> {
        let outcome = self
            .inner
            .update_many(filter, stamp(update))
            .await
            .map_err(db_err("bulk update"))?;
        Ok(outcome.modified_count)
    }

    /// Used to undo a half-finished insert
    pub async fn delete_one(&self, filter: Document) -> Result<bool, HandoffError> {
        let outcome = self
            .inner
            .delete_one(filter)
            .await
            .map_err(db_err("delete"))?;
        Ok(outcome.deleted_count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_merges_into_existing_set() {
        let update = stamp(doc! { "$set": { "status": "claimed" }, "$unset": { "x": "" } });
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "claimed");
        assert!(set.contains_key("metadata.written_at"));
        assert!(update.contains_key("$unset"));
    }

    #[test]
    fn test_stamp_adds_set_stage() {
        let update = stamp(doc! { "$inc": { "n": 1 } });
        assert!(update
            .get_document("$set")
            .unwrap()
            .contains_key("metadata.written_at"));
    }
}
