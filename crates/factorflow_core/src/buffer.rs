use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferKind {
    /// Provided by the caller.
    Input,
    /// Returned to the caller.
    Output,
    /// Only passed between stages.
    Temp,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Input => "INPUT",
            Self::Output => "OUTPUT",
            Self::Temp => "TEMP",
        };
        write!(f, "{s}")
    }
}

/// A named region of memory crossing a stage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Buffer {
    pub id: usize,
    pub name: String,
    pub kind: BufferKind,
}

/// Hands out buffer ids by name.
///
/// Ids are dense and assigned in first-seen order. The kind of a buffer is
/// fixed by its first registration.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: IndexMap<String, Buffer>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the buffer for `name`, registering it with `kind` if it's new.
    pub fn resolve(&mut self, name: &str, kind: BufferKind) -> &Buffer {
        let id = self.buffers.len();
        self.buffers
            .entry(name.to_string())
            .or_insert_with(|| Buffer {
                id,
                name: name.to_string(),
                kind,
            })
    }

    pub fn get(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.values()
    }

    /// Consume the registry, returning buffers ordered by id.
    pub fn into_buffers(self) -> Vec<Buffer> {
        self.buffers.into_values().collect()
    }
}
