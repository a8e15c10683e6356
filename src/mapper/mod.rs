//! Entity mappers: cached views of the store, one per entity kind.
//!
//! Each mapper builds an in-memory snapshot at construction and keeps it in
//! sync by writing through to the store first and updating the cache only
//! on success. A mapper is the only component allowed to touch its prefix
//! in the store.

mod group;
mod gslb;
mod sentinel;
mod template;
mod topom;

pub use group::StoreGroupMapper;
pub use gslb::StoreGslbMapper;
pub use sentinel::StoreSentinelMapper;
pub use template::StoreTemplateFileMapper;
pub use topom::StoreTopomMapper;

use crate::error::Result;
use crate::model::{Group, Groups, Gslb, Gslbs, Sentinel, TemplateFiles, Topom};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Leader-registration record access.
#[async_trait]
pub trait TopomMapper: Send + Sync {
    async fn create(&self) -> Result<()>;
    async fn delete(&self) -> Result<()>;
    fn info(&self) -> Topom;
}

/// Replication-group record access.
#[async_trait]
pub trait GroupMapper: Send + Sync {
    async fn create(&self, group: &Group) -> Result<()>;
    async fn update(&self, group: &Group) -> Result<()>;
    async fn remove(&self, group: &Group) -> Result<()>;
    fn info(&self) -> Groups;
}

/// Sentinel-set record access.
#[async_trait]
pub trait SentinelMapper: Send + Sync {
    async fn update(&self, sentinel: &Sentinel) -> Result<()>;
    fn info(&self) -> Sentinel;
}

/// GSLB record access.
#[async_trait]
pub trait GslbMapper: Send + Sync {
    async fn update(&self, gslb: &Gslb) -> Result<()>;
    async fn delete(&self, gslb: &Gslb) -> Result<()>;
    fn info(&self) -> Gslbs;
}

/// Template-file snapshot access.
pub trait TemplateFileMapper: Send + Sync {
    fn info(&self) -> TemplateFiles;
}

/// Store records are pretty-printed JSON so they stay readable in store
/// inspection tools.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}
