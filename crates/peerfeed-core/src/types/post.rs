//! Post - a short signed text record
//!
//! A post is created unsigned, persisted (which assigns its ID and
//! timestamp), then signed over its canonical payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::canonical_post_payload;

/// A text post authored by some peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Unique ID (ULID), assigned on first persistence; empty until then
    #[serde(default)]
    pub id: String,

    /// Peer ID of the author
    #[serde(default)]
    pub author_id: String,

    /// Post body
    pub content: String,

    /// Fixed at first persistence, never modified thereafter
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    /// Opaque attachment references, in order
    #[serde(default)]
    pub attachments: Vec<String>,

    /// Hex signature over the canonical payload; `None` while unsigned
    #[serde(default)]
    pub signature: Option<String>,
}

impl Post {
    /// Create an unsigned draft with only content set
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            author_id: String::new(),
            content: content.into(),
            created_at: None,
            attachments: Vec::new(),
            signature: None,
        }
    }

    /// Attach opaque references (builder style)
    pub fn with_attachments(mut self, attachments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.attachments = attachments.into_iter().map(Into::into).collect();
        self
    }

    /// `created_at` truncated to whole Unix seconds
    pub fn created_at_secs(&self) -> Option<i64> {
        self.created_at.map(|t| t.timestamp())
    }

    /// The bytes a signature over this post covers
    ///
    /// Returns `None` when the post has no timestamp yet (never persisted).
    pub fn signing_payload(&self) -> Option<Vec<u8>> {
        self.created_at_secs()
            .map(|secs| canonical_post_payload(&self.id, &self.content, secs))
    }

    /// True when a signature is present
    pub fn is_signed(&self) -> bool {
        self.signature.as_deref().is_some_and(|s| !s.is_empty())
    }
}
