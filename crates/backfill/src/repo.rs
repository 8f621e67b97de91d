//! Contract between the engine and the external CAR block decoder.
//!
//! The engine never parses CAR bytes itself: it hands the snapshot body (or
//! a live commit's block section) to a [`CarDecoder`] and works with the
//! resulting block store and record iterator. Merkle verification is the
//! decoder's responsibility; CIDs handed back by the decoder are trusted.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::BackfillError;

/// Opaque, equality-comparable handle to an immutable block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cid(String);

impl Cid {
    pub fn new(cid: impl Into<String>) -> Self {
        Self(cid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cid {
    fn from(cid: &str) -> Self {
        Self(cid.to_owned())
    }
}

/// A store of raw blocks indexable by CID.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the raw bytes of a block. Missing blocks surface as
    /// [`BackfillError::MissingBlock`].
    async fn get_block(&self, cid: &Cid) -> Result<Bytes, BackfillError>;
}

/// A decoded repo checkout: a block store plus the signed root commit.
pub trait CheckoutRepo: BlockSource {
    /// Rev of the signed root commit.
    fn rev(&self) -> &str;

    /// Iterate every record whose `collection/rkey` path starts with
    /// `prefix` (empty prefix matches all). The filter is applied by the
    /// iterator so unrelated collections never incur block fetches.
    fn records<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Box<dyn Iterator<Item = Result<(String, Cid), BackfillError>> + Send + 'a>;
}

/// Decoder for the content-addressed archive format.
#[async_trait]
pub trait CarDecoder: Send + Sync + 'static {
    type Repo: CheckoutRepo + Send + Sync;
    type Blocks: BlockSource + Send + Sync;

    /// Decode a full or incremental repo checkout from a CAR byte stream.
    async fn read_repo(
        &self,
        car: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Self::Repo, BackfillError>;

    /// Decode the loose block section attached to a live commit into a
    /// transient block store.
    async fn read_blocks(&self, car: Bytes) -> Result<Self::Blocks, BackfillError>;
}
