//! In-memory keyword index and executor.
//!
//! Used by the daemon binary for demo serving and by the integration tests
//! as the seeded index. The body layout is the executor's own: requests are
//! `str index, str query`, replies are `u32 count` followed by the matching
//! documents as strings.

use std::any::Any;

use crate::net::buf::{InBuf, OutBuf};
use crate::net::wire::DEFAULT_MAX_PACKET;

use super::served::{SearchIndex, Served};
use super::{ExecError, ExecOutput, QueryExecutor};

/// A flat list of documents searched by case-insensitive substring.
pub struct MemIndex {
    docs: Vec<String>,
}

impl MemIndex {
    pub fn new(docs: Vec<String>) -> MemIndex {
        MemIndex { docs }
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    fn matches(&self, query: &str) -> Vec<&str> {
        let needle = query.to_lowercase();
        self.docs
            .iter()
            .filter(|d| d.to_lowercase().contains(&needle))
            .map(String::as_str)
            .collect()
    }
}

impl SearchIndex for MemIndex {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Executor over [`MemIndex`] handles.
#[derive(Default)]
pub struct MemExecutor;

impl MemExecutor {
    pub fn new() -> MemExecutor {
        MemExecutor
    }

    /// Frame a request body for `index` / `query`.
    pub fn request(index: &str, query: &str) -> Vec<u8> {
        let mut out = OutBuf::new();
        out.put_str(index);
        out.put_str(query);
        out.into_vec()
    }

    /// Decode a reply body back into matched documents.
    pub fn decode_reply(body: &[u8]) -> Vec<String> {
        let mut inp = InBuf::new(body, DEFAULT_MAX_PACKET);
        let n = inp.get_u32();
        (0..n).map(|_| inp.get_string()).collect()
    }
}

impl QueryExecutor for MemExecutor {
    fn target_index(&self, body: &[u8]) -> Result<String, ExecError> {
        let mut inp = InBuf::new(body, DEFAULT_MAX_PACKET);
        let index = inp.get_string();
        if inp.error() || index.is_empty() {
            return Err(ExecError("malformed request: missing index name".into()));
        }
        Ok(index)
    }

    fn execute(&self, index: &Served, body: &[u8]) -> Result<ExecOutput, ExecError> {
        let mut inp = InBuf::new(body, DEFAULT_MAX_PACKET);
        let _name = inp.get_string();
        let query = inp.get_string();
        if inp.error() {
            return Err(ExecError("malformed request body".into()));
        }

        let guard = index.read();
        let mem = guard
            .index
            .as_any()
            .downcast_ref::<MemIndex>()
            .ok_or_else(|| ExecError("index backend mismatch".into()))?;

        let matches = mem.matches(&query);
        let mut out = OutBuf::new();
        out.put_u32(matches.len() as u32);
        for doc in &matches {
            out.put_str(doc);
        }
        Ok(ExecOutput {
            rows: matches.len() as u64,
            body: out.into_vec(),
        })
    }

    fn build_remote(&self, body: &[u8], target_indexes: &str) -> Vec<u8> {
        let mut inp = InBuf::new(body, DEFAULT_MAX_PACKET);
        let _old = inp.get_string();
        let query = inp.get_string();
        Self::request(target_indexes, &query)
    }

    fn merge(&self, parts: Vec<Vec<u8>>) -> ExecOutput {
        let mut docs: Vec<String> = Vec::new();
        for part in &parts {
            docs.extend(Self::decode_reply(part));
        }
        let mut out = OutBuf::new();
        out.put_u32(docs.len() as u32);
        for doc in &docs {
            out.put_str(doc);
        }
        ExecOutput {
            rows: docs.len() as u64,
            body: out.into_vec(),
        }
    }
}
