//! Operator-managed address blocklist.
//!
//! Every call goes straight to the backing store so that a block takes
//! effect on the very next request.

use crate::address::canonical_address;
use crate::models::BlockedAddress;
use crate::store::{BlockedAddressStore, StoreError};
use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

/// Error surfaced to the operator.
#[derive(Debug, thiserror::Error)]
pub enum BlockListError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),
    #[error("IP {0} is not in the blocklist")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a `block` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// A new record was created.
    Created,
    /// The address was already blocked with the same (or no new) reason.
    AlreadyBlocked,
    /// The address was already blocked; its reason was replaced.
    ReasonUpdated { previous: String },
}

/// Blocklist backed by a [`BlockedAddressStore`].
pub struct BlockList {
    store: Arc<dyn BlockedAddressStore>,
}

impl BlockList {
    pub fn new(store: Arc<dyn BlockedAddressStore>) -> Self {
        Self { store }
    }

    /// Whether `address` has an active block. Any spelling of a blocked IP matches.
    pub async fn is_blocked(&self, address: &str) -> Result<bool, StoreError> {
        self.store.exists(&canonical_address(address)).await
    }

    /// Block `address`. Re-blocking replaces the reason when a non-empty,
    /// different one is given; it never creates a second record.
    pub async fn block(&self, address: &str, reason: &str) -> Result<BlockOutcome, BlockListError> {
        let address = normalize(address)?;

        let record = BlockedAddress {
            address: address.clone(),
            blocked_at: Utc::now(),
            reason: reason.to_string(),
        };

        if self.store.insert(&record).await? {
            info!(address = %address, reason = %reason, "Address blocked");
            return Ok(BlockOutcome::Created);
        }

        let previous = self
            .store
            .get(&address)
            .await?
            .map(|existing| existing.reason)
            .unwrap_or_default();

        if reason.is_empty() || reason == previous {
            return Ok(BlockOutcome::AlreadyBlocked);
        }

        self.store.update_reason(&address, reason).await?;
        info!(address = %address, reason = %reason, "Block reason updated");
        Ok(BlockOutcome::ReasonUpdated { previous })
    }

    /// Remove the block on `address`.
    pub async fn unblock(&self, address: &str) -> Result<(), BlockListError> {
        let address = normalize(address)?;

        if !self.store.delete(&address).await? {
            return Err(BlockListError::NotFound(address));
        }

        info!(address = %address, "Address unblocked");
        Ok(())
    }

    /// All blocks, most recent first.
    pub async fn list(&self) -> Result<Vec<BlockedAddress>, BlockListError> {
        Ok(self.store.list().await?)
    }
}

/// Validate an operator-supplied address and return its canonical text form.
fn normalize(address: &str) -> Result<String, BlockListError> {
    address
        .trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| BlockListError::InvalidAddress(address.to_string()))
}
