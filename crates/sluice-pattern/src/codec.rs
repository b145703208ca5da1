//! JSON encoding of blocks, requests, and pooled patterns.
//!
//! Patterns are exchanged as short-keyed JSON documents (see the serde
//! renames on [`WriteBlock`](crate::WriteBlock) and
//! [`ReadRequest`](crate::ReadRequest)). A pooled write pattern holds
//! one block array per rank plus the attribute map; a pooled read
//! pattern is an array with one entry per rank.
//!
//! Decoded documents come from another process, so [`decode`] checks
//! every box and buffer range before handing the value out.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sluice_core::BoxRegion;

use crate::descriptor::{
    ReadPattern, ReadRequest, ShapeKind, WriteBlock, WritePattern, WriterMetadata,
};
use crate::error::PatternError;

/// A document whose fields can be checked after decoding.
pub trait Validate {
    /// Reject values no local constructor would have produced.
    fn validate(&self) -> Result<(), PatternError>;
}

/// Encode any pattern document.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PatternError> {
    serde_json::to_vec(value).map_err(|e| PatternError::Codec(e.to_string()))
}

/// Decode and validate a pattern document.
pub fn decode<T: DeserializeOwned + Validate>(bytes: &[u8]) -> Result<T, PatternError> {
    let value: T =
        serde_json::from_slice(bytes).map_err(|e| PatternError::Codec(e.to_string()))?;
    value.validate()?;
    Ok(value)
}

fn invalid(what: &str, name: &str, reason: impl std::fmt::Display) -> PatternError {
    PatternError::Codec(format!("{what} of '{name}': {reason}"))
}

impl Validate for WriteBlock {
    fn validate(&self) -> Result<(), PatternError> {
        let bad = |reason: String| invalid("block", &self.name, reason);
        self.region().check().map_err(|e| bad(e.to_string()))?;
        match self.shape_kind {
            ShapeKind::GlobalValue if self.region().ndim() != 0 || !self.shape.is_empty() => {
                return Err(bad("single value with dimensions".into()));
            }
            ShapeKind::GlobalValue => {}
            ShapeKind::GlobalArray => {
                BoxRegion::from_shape(&self.shape)
                    .check()
                    .map_err(|e| bad(format!("shape: {e}")))?;
                if !self.region().fits_in(&self.shape) {
                    return Err(bad("box extends past the global shape".into()));
                }
            }
        }
        if !self.data_type.is_fixed_size()
            && (self.shape_kind != ShapeKind::GlobalValue || self.operator.is_some())
        {
            return Err(bad(format!(
                "{} blocks must be plain single values",
                self.data_type
            )));
        }
        if self.data_type.is_fixed_size() && self.shape_kind == ShapeKind::GlobalArray {
            self.region()
                .element_count()
                .checked_mul(self.data_type.size())
                .ok_or_else(|| bad("byte length overflows".into()))?;
        }
        self.buffer_start
            .checked_add(self.buffer_count)
            .ok_or_else(|| bad("buffer range overflows".into()))?;
        Ok(())
    }
}

impl Validate for ReadRequest {
    fn validate(&self) -> Result<(), PatternError> {
        self.region()
            .check()
            .map_err(|e| invalid("request", &self.name, e))
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> Result<(), PatternError> {
        self.iter().try_for_each(Validate::validate)
    }
}

impl Validate for WriterMetadata {
    fn validate(&self) -> Result<(), PatternError> {
        self.blocks.validate()
    }
}

impl Validate for WritePattern {
    fn validate(&self) -> Result<(), PatternError> {
        self.blocks().try_for_each(Validate::validate)
    }
}

impl Validate for ReadPattern {
    fn validate(&self) -> Result<(), PatternError> {
        self.iter()
            .flat_map(|(_, requests)| requests)
            .try_for_each(Validate::validate)
    }
}
