//! Persistence seams used by the consumers.

pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::msg::Intensity;

pub use postgres::PgStore;

/// Persist one payload. Saving the same payload twice must be harmless.
#[async_trait]
pub trait Save<T: Sync>: Send + Sync + 'static {
    async fn save(&self, item: &T) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: Sync + 'static, S: Save<T> + ?Sized> Save<T> for Arc<S> {
    async fn save(&self, item: &T) -> Result<(), StoreError> {
        (**self).save(item).await
    }
}

/// Intensity storage with expiry of measured values.
#[async_trait]
pub trait IntensityStore: Save<Intensity> {
    /// Delete measured intensities older than `before`. Returns the rows removed.
    async fn expire_measured(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S: IntensityStore + ?Sized> IntensityStore for Arc<S> {
    async fn expire_measured(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).expire_measured(before).await
    }
}
