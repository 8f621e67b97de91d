//! The unit captured from live events while a job is not yet complete.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::repo::Cid;

/// Kind of record mutation carried by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single buffered record mutation. Deletes carry no payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedOp {
    pub kind: OpKind,
    /// `<collection>/<rkey>` path of the record within its repo.
    pub path: String,
    /// Raw encoded record bytes; absent for deletes.
    pub rec: Option<Bytes>,
    /// Block CID of the record; absent for deletes.
    pub cid: Option<Cid>,
}

impl BufferedOp {
    pub fn create(path: impl Into<String>, rec: Bytes, cid: Cid) -> Self {
        Self {
            kind: OpKind::Create,
            path: path.into(),
            rec: Some(rec),
            cid: Some(cid),
        }
    }

    pub fn update(path: impl Into<String>, rec: Bytes, cid: Cid) -> Self {
        Self {
            kind: OpKind::Update,
            path: path.into(),
            rec: Some(rec),
            cid: Some(cid),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            path: path.into(),
            rec: None,
            cid: None,
        }
    }
}

/// All ops of a single commit, kept as one atomic group. Within a group the
/// order matches the commit's op order; the buffer is an ordered sequence of
/// groups tagged with the commit rev and its claimed parent rev.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpGroup {
    pub since: Option<String>,
    pub rev: String,
    pub ops: Vec<BufferedOp>,
}

impl OpGroup {
    pub fn new(since: Option<String>, rev: impl Into<String>, ops: Vec<BufferedOp>) -> Self {
        Self {
            since,
            rev: rev.into(),
            ops,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_carries_no_payload() {
        let op = BufferedOp::delete("app.bsky.feed.post/3kabc");
        assert_eq!(op.kind, OpKind::Delete);
        assert!(op.rec.is_none());
        assert!(op.cid.is_none());
    }

    #[test]
    fn create_keeps_payload_and_cid() {
        let op = BufferedOp::create(
            "app.bsky.feed.post/3kabc",
            Bytes::from_static(b"rec"),
            Cid::new("bafy1"),
        );
        assert_eq!(op.kind, OpKind::Create);
        assert_eq!(op.rec.as_deref(), Some(&b"rec"[..]));
        assert_eq!(op.cid, Some(Cid::new("bafy1")));
    }

    #[test]
    fn op_kind_display() {
        assert_eq!(OpKind::Create.to_string(), "create");
        assert_eq!(OpKind::Update.to_string(), "update");
        assert_eq!(OpKind::Delete.to_string(), "delete");
    }
}
