//! Shared application state handed to every handler.

use crate::services::{
    authorizer::TokenAuthorizer, blob_service::BlobService, datastore::Datastore,
    usage_tracker::UsageTracker,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub blobs: BlobService,
    pub datastore: Arc<dyn Datastore>,
    pub authorizer: Arc<TokenAuthorizer>,
    pub usage: UsageTracker,
}
