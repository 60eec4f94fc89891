//! Content hashing for values and action inputs
//!
//! Every hash is a lowercase hex SHA-256 digest. A value hashes as the
//! concatenation of its byte sources; an action's input hash is the digest of
//! its input values' hex hashes concatenated in declaration order.

use crate::error::{KilnError, KilnResult};
use crate::value::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

const BUFFER_SIZE: usize = 8192;

/// One ordered piece of a value's content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl ContentSource {
    fn feed(&self, hasher: &mut Sha256, buffer: &mut [u8]) -> KilnResult<()> {
        match self {
            Self::Bytes(bytes) => hasher.update(bytes),
            Self::File(path) => {
                let mut file = File::open(path)
                    .map_err(|e| KilnError::io(format!("opening {} for hashing", path.display()), e))?;
                loop {
                    let count = file
                        .read(buffer)
                        .map_err(|e| KilnError::io(format!("hashing {}", path.display()), e))?;
                    if count == 0 {
                        break;
                    }
                    hasher.update(&buffer[..count]);
                }
            }
        }
        Ok(())
    }
}

/// Hash an ordered list of sources into one hex digest
pub fn hash_sources(sources: &[ContentSource]) -> KilnResult<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    for source in sources {
        source.feed(&mut hasher, &mut buffer)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a single value's content
pub fn hash_value(value: &Value) -> KilnResult<String> {
    hash_sources(&value.content_sources()?)
}

/// Combine per-value hashes into an action input hash
pub fn combine_hashes<S: AsRef<str>>(hashes: &[S]) -> String {
    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Value hashes memoized for the duration of one graph execution
#[derive(Debug, Default)]
pub struct HashCache {
    hashes: HashMap<Value, String>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of `value`, computing it on first use
    pub fn hash(&mut self, value: &Value) -> KilnResult<String> {
        if let Some(existing) = self.hashes.get(value) {
            return Ok(existing.clone());
        }
        let computed = hash_value(value)?;
        self.hashes.insert(value.clone(), computed.clone());
        Ok(computed)
    }

    pub fn hash_all(&mut self, values: &[Value]) -> KilnResult<Vec<String>> {
        values.iter().map(|v| self.hash(v)).collect()
    }

    /// Forget cached hashes, e.g. after the underlying outputs are rewritten
    pub fn invalidate(&mut self, values: &[Value]) {
        for v in values {
            self.hashes.remove(v);
        }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
