//! Remote data source interface.

use crate::error::Result;
use crate::types::{EntityKind, Filter};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Read side of the remote store.
///
/// Rows are returned raw and validated by the caller. Mutations are issued
/// by UI code directly against the backend and are not part of this trait.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_all(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Value>>;
}

/// Shared data source handle.
pub type SharedDataSource = Arc<dyn DataSource>;
