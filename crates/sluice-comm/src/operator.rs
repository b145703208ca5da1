//! Payload operators (compression and other reversible transforms).

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::OperatorError;

/// String parameters passed to an operator.
pub type OperatorParams = BTreeMap<String, String>;

/// A reversible transform applied to a block's bytes before transfer.
pub trait Operator: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Transform `data` (elements of `element_size` bytes).
    fn compress(
        &self,
        data: &[u8],
        element_size: usize,
        params: &OperatorParams,
    ) -> Result<Vec<u8>, OperatorError>;

    /// Invert [`compress`](Self::compress). `raw_len` is the expected
    /// output length.
    fn decompress(
        &self,
        data: &[u8],
        raw_len: usize,
        params: &OperatorParams,
    ) -> Result<Vec<u8>, OperatorError>;
}

/// Operators available to a stream, by name, in registration order.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    ops: IndexMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `op` under its own name, replacing any previous entry.
    pub fn register(&mut self, op: Arc<dyn Operator>) {
        self.ops.insert(op.name().to_string(), op);
    }

    /// Look up an operator.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Operator>, OperatorError> {
        self.ops
            .get(name)
            .cloned()
            .ok_or_else(|| OperatorError::Unknown {
                name: name.to_string(),
            })
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ops.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reverse;

    impl Operator for Reverse {
        fn name(&self) -> &str {
            "reverse"
        }
        fn compress(
            &self,
            data: &[u8],
            _: usize,
            _: &OperatorParams,
        ) -> Result<Vec<u8>, OperatorError> {
            Ok(data.iter().rev().copied().collect())
        }
        fn decompress(
            &self,
            data: &[u8],
            raw_len: usize,
            _: &OperatorParams,
        ) -> Result<Vec<u8>, OperatorError> {
            if data.len() != raw_len {
                return Err(OperatorError::Failed {
                    name: "reverse".into(),
                    reason: "length".into(),
                });
            }
            Ok(data.iter().rev().copied().collect())
        }
    }

    #[test]
    fn lookup_by_name() {
        let mut reg = OperatorRegistry::new();
        reg.register(Arc::new(Reverse));
        let op = reg.get("reverse").unwrap();
        let packed = op.compress(&[1, 2, 3], 1, &OperatorParams::new()).unwrap();
        assert_eq!(op.decompress(&packed, 3, &OperatorParams::new()).unwrap(), vec![1, 2, 3]);
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["reverse"]);
    }

    #[test]
    fn unknown_name() {
        match OperatorRegistry::new().get("zfp") {
            Err(OperatorError::Unknown { name }) => assert_eq!(name, "zfp"),
            Err(other) => panic!("expected Unknown, got {other:?}"),
            Ok(_) => panic!("expected Unknown, got an operator"),
        }
    }
}
