use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::HarnessError;

/// Response shape for one (method, path) pair, as written in the config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionConfig {
    pub status_code: u16,
    pub headers: IndexMap<String, String>,
    pub num_chunks: u32,
    pub chunk_size_bytes: usize,
    pub chunk_byte_value: u8,
    pub delay_first_chunk_millis: u64,
    pub delay_between_chunk_millis: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: IndexMap::new(),
            num_chunks: 0,
            chunk_size_bytes: 1024,
            chunk_byte_value: 42,
            delay_first_chunk_millis: 0,
            delay_between_chunk_millis: 0,
        }
    }
}

/// A validated action together with its prebuilt response-chunk buffer.
#[derive(Debug)]
pub struct Action {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub num_chunks: u32,
    pub delay_first_chunk: Duration,
    pub delay_between_chunks: Duration,
    chunk: Bytes,
}

impl Action {
    /// Validates `config` and fills the chunk buffer.
    pub fn build(config: &ActionConfig) -> Result<Self, HarnessError> {
        let status = StatusCode::from_u16(config.status_code).map_err(|_| {
            HarnessError::config(format!("invalid status_code {}", config.status_code))
        })?;

        let mut headers = Vec::with_capacity(config.headers.len());
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HarnessError::config(format!("invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                HarnessError::config(format!("invalid value for header '{}'", name))
            })?;
            headers.push((name, value));
        }

        if config.num_chunks > 0 && config.chunk_size_bytes == 0 {
            return Err(HarnessError::config(
                "chunk_size_bytes must be positive when num_chunks is set",
            ));
        }

        Ok(Self {
            status,
            headers,
            num_chunks: config.num_chunks,
            delay_first_chunk: Duration::from_millis(config.delay_first_chunk_millis),
            delay_between_chunks: Duration::from_millis(config.delay_between_chunk_millis),
            chunk: Bytes::from(vec![config.chunk_byte_value; config.chunk_size_bytes]),
        })
    }

    /// The buffer written for every chunk of every response to this action.
    pub fn chunk(&self) -> Bytes {
        self.chunk.clone()
    }

    /// Total body length a complete response carries.
    pub fn body_len(&self) -> usize {
        self.chunk.len() * self.num_chunks as usize
    }

    pub(crate) fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

type RawActions = IndexMap<String, IndexMap<String, ActionConfig>>;

/// Exact-match routing table from (method, path) to [`Action`].
///
/// Deserializes from `{ "GET": { "/path": { ... } } }`; every buffer is built
/// while loading, so lookups never allocate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "RawActions")]
pub struct ActionTable {
    routes: HashMap<Method, HashMap<String, Arc<Action>>>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the action for `method` and `path`.
    pub fn insert(
        &mut self,
        method: Method,
        path: impl Into<String>,
        config: &ActionConfig,
    ) -> Result<(), HarnessError> {
        let action = Action::build(config)?;
        self.routes
            .entry(method)
            .or_default()
            .insert(path.into(), Arc::new(action));
        Ok(())
    }

    /// Builder-style [`ActionTable::insert`].
    pub fn with(
        mut self,
        method: Method,
        path: impl Into<String>,
        config: ActionConfig,
    ) -> Result<Self, HarnessError> {
        self.insert(method, path, &config)?;
        Ok(self)
    }

    pub fn get(&self, method: &Method, path: &str) -> Option<Arc<Action>> {
        self.routes.get(method)?.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TryFrom<RawActions> for ActionTable {
    type Error = HarnessError;

    fn try_from(raw: RawActions) -> Result<Self, Self::Error> {
        let mut table = ActionTable::new();
        for (method, paths) in raw {
            let method = Method::from_bytes(method.as_bytes())
                .map_err(|_| HarnessError::config(format!("invalid HTTP method '{}'", method)))?;
            for (path, config) in paths {
                table.insert(method.clone(), path, &config)?;
            }
        }
        Ok(table)
    }
}
