//! Cluster node affinity
//!
//! Every suspended attempt lives on the node that issued it. Nodes are
//! announced in the compact `url|id` form; the registry keeps the original
//! URL for redirects and compares URLs only in their lower-cased form.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use turnstile_common::AttemptId;

use crate::error::EngineError;

const SEPARATOR: char = '|';
const NODE_ID_LEN: usize = 2;

/// One cluster node parsed from `url|id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffinityEntry {
    pub node_id: String,
    /// URL as announced, used for redirects
    pub original_url: String,
    /// Lower-cased URL, used for comparison
    pub canonical_url: String,
}

impl NodeAffinityEntry {
    /// Parse the `url|id[|...]` encoding.
    ///
    /// Segments after the id are ignored. When such a segment is present
    /// the id is cut to its first two characters; a bare `url|id` keeps the
    /// id whole. The URL is stored exactly as given.
    pub fn parse(encoded: &str) -> Result<Self, EngineError> {
        let (url, rest) = encoded
            .split_once(SEPARATOR)
            .ok_or_else(|| EngineError::MalformedEntry(format!("missing separator: {encoded}")))?;
        let id = match rest.split_once(SEPARATOR) {
            Some((id, _)) => id.trim().chars().take(NODE_ID_LEN).collect(),
            None => rest.trim().to_string(),
        };

        if url.trim().is_empty() {
            return Err(EngineError::MalformedEntry(format!("empty url: {encoded}")));
        }
        if id.is_empty() {
            return Err(EngineError::MalformedEntry(format!("empty node id: {encoded}")));
        }

        Ok(Self {
            node_id: id,
            original_url: url.to_string(),
            canonical_url: url.trim().to_lowercase(),
        })
    }

    /// Case-insensitive URL comparison
    #[must_use]
    pub fn matches_url(&self, url: &str) -> bool {
        self.canonical_url == url.trim().to_lowercase()
    }
}

impl FromStr for NodeAffinityEntry {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Where a follow-up round for an attempt has to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Handled by this node
    Local,
    /// Owned by another node
    Remote(NodeAffinityEntry),
    /// Owned by a node this process does not know
    Unknown(String),
}

/// Known cluster nodes, keyed by node id with a canonical-URL index
#[derive(Debug, Default)]
pub struct NodeAffinityRegistry {
    local_node: Option<String>,
    nodes: DashMap<String, NodeAffinityEntry>,
    by_url: DashMap<String, String>,
}

impl NodeAffinityRegistry {
    #[must_use]
    pub fn new(local_node: Option<String>) -> Self {
        Self {
            local_node: local_node.filter(|n| !n.is_empty()),
            ..Self::default()
        }
    }

    /// Build from encoded node entries. Any malformed entry fails the whole set.
    pub fn from_encoded<I, S>(local_node: Option<String>, encoded: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::new(local_node);
        for entry in encoded {
            registry.upsert(NodeAffinityEntry::parse(entry.as_ref())?);
        }
        Ok(registry)
    }

    pub fn local_node(&self) -> Option<&str> {
        self.local_node.as_deref()
    }

    /// Add or replace a node
    pub fn upsert(&self, entry: NodeAffinityEntry) {
        if let Some(previous) = self.nodes.insert(entry.node_id.clone(), entry.clone()) {
            if previous.canonical_url != entry.canonical_url {
                self.by_url.remove(&previous.canonical_url);
            }
        }
        self.by_url.insert(entry.canonical_url, entry.node_id);
    }

    pub fn remove(&self, node_id: &str) -> Option<NodeAffinityEntry> {
        let (_, entry) = self.nodes.remove(node_id)?;
        self.by_url
            .remove_if(&entry.canonical_url, |_, id| id == node_id);
        Some(entry)
    }

    pub fn get(&self, node_id: &str) -> Option<NodeAffinityEntry> {
        self.nodes.get(node_id).map(|e| e.value().clone())
    }

    /// Look a node up by URL, ignoring case
    pub fn find_by_url(&self, url: &str) -> Option<NodeAffinityEntry> {
        let id = self.by_url.get(&url.trim().to_lowercase())?.value().clone();
        self.get(&id)
    }

    /// Decide which node owns an attempt
    pub fn route(&self, attempt: &AttemptId) -> Route {
        match (attempt.node_id(), self.local_node.as_deref()) {
            (None, _) | (_, None) => Route::Local,
            (Some(owner), Some(local)) if owner == local => Route::Local,
            (Some(owner), Some(_)) => self
                .get(owner)
                .map_or_else(|| Route::Unknown(owner.to_string()), Route::Remote),
        }
    }

    /// Fail with [`EngineError::WrongNode`] unless this node owns the attempt
    pub fn ensure_local(&self, attempt: &AttemptId) -> Result<(), EngineError> {
        match self.route(attempt) {
            Route::Local => Ok(()),
            Route::Remote(entry) => Err(EngineError::WrongNode {
                node_id: entry.node_id,
                redirect_url: Some(entry.original_url),
            }),
            Route::Unknown(node_id) => Err(EngineError::WrongNode {
                node_id,
                redirect_url: None,
            }),
        }
    }

    pub fn entries(&self) -> Vec<NodeAffinityEntry> {
        let mut entries: Vec<_> = self.nodes.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
