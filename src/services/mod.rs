pub mod authorizer;
pub mod blob_service;
pub mod datastore;
pub mod storage;
pub mod tee;
pub mod usage_tracker;
