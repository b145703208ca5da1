//! Block and request descriptors, and their pooled patterns.

use serde::{Deserialize, Serialize};
use sluice_core::{BoxRegion, DataType, Dims, Rank};
use std::collections::BTreeMap;

use crate::attribute::{merge_attributes, Attributes};

/// How a variable's blocks relate to a global shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    /// Blocks of an n-dimensional global array.
    #[serde(rename = "array")]
    GlobalArray,
    /// One scalar per step; shape, start, and count are empty.
    #[serde(rename = "value")]
    GlobalValue,
}

/// Payload transform applied to a block before transfer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorSpec {
    /// Registered operator name.
    #[serde(rename = "N")]
    pub name: String,
    /// Operator parameters.
    #[serde(rename = "P", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// One block written by one writer rank for one variable in one step.
///
/// `buffer_start`/`buffer_count` locate the block's (possibly
/// operator-transformed) bytes inside the writer's step buffer, whose
/// first byte is a control byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBlock {
    /// Variable name.
    #[serde(rename = "N")]
    pub name: String,
    /// Element type.
    #[serde(rename = "T")]
    pub data_type: DataType,
    /// Array or single value.
    #[serde(rename = "K")]
    pub shape_kind: ShapeKind,
    /// Global shape of the variable.
    #[serde(rename = "S")]
    pub shape: Dims,
    /// Offset of this block in the global array.
    #[serde(rename = "O")]
    pub start: Dims,
    /// Extent of this block.
    #[serde(rename = "C")]
    pub count: Dims,
    /// Writer rank that owns the block.
    #[serde(rename = "R")]
    pub rank: Rank,
    /// Index among all blocks of this variable across the writer group.
    #[serde(rename = "I")]
    pub block_index: usize,
    /// Byte offset in the owning writer's step buffer.
    #[serde(rename = "BS")]
    pub buffer_start: usize,
    /// Byte length in the owning writer's step buffer.
    #[serde(rename = "BC")]
    pub buffer_count: usize,
    /// Operator applied to the block's bytes, if any.
    #[serde(rename = "Op", default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<OperatorSpec>,
}

impl WriteBlock {
    /// Box covered by the block in global coordinates.
    pub fn region(&self) -> BoxRegion {
        BoxRegion {
            start: self.start.clone(),
            count: self.count.clone(),
        }
    }

    /// Raw (untransformed) byte size of the block's elements.
    ///
    /// For variable-length types this is the stored payload length.
    pub fn raw_len(&self) -> usize {
        if self.data_type.is_fixed_size() {
            self.region().element_count() * self.data_type.size()
        } else {
            self.buffer_count
        }
    }
}

/// One variable request issued by one reader rank.
///
/// `start`/`count` are always global coordinates: selections are
/// resolved against the write pattern before a request is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Variable name.
    #[serde(rename = "N")]
    pub name: String,
    /// Requested element type.
    #[serde(rename = "T")]
    pub data_type: DataType,
    /// Requested box start.
    #[serde(rename = "O")]
    pub start: Dims,
    /// Requested box count.
    #[serde(rename = "C")]
    pub count: Dims,
    /// Reader rank issuing the request.
    #[serde(rename = "R")]
    pub rank: Rank,
    /// Block restriction, if the selection named one.
    #[serde(rename = "B", default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<usize>,
}

impl ReadRequest {
    /// Requested box in global coordinates.
    pub fn region(&self) -> BoxRegion {
        BoxRegion {
            start: self.start.clone(),
            count: self.count.clone(),
        }
    }
}

/// Declared properties of one variable, as seen in a write pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableInfo {
    /// Element type.
    pub data_type: DataType,
    /// Array or single value.
    pub shape_kind: ShapeKind,
    /// Global shape.
    pub shape: Dims,
}

/// What one writer rank contributes to a full exchange.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterMetadata {
    /// Blocks written this step, in write order.
    #[serde(rename = "B")]
    pub blocks: Vec<WriteBlock>,
    /// Every attribute this writer has defined.
    #[serde(rename = "A", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

/// Write blocks of a whole writer group, indexed by rank, with the
/// group's attributes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WritePattern {
    #[serde(rename = "W")]
    ranks: Vec<Vec<WriteBlock>>,
    #[serde(rename = "A", default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: Attributes,
}

impl WritePattern {
    /// Pool per-rank block lists.
    ///
    /// Stamps each block with its owning rank and assigns block indices
    /// per variable in ascending rank order, then write order.
    pub fn from_ranks(mut ranks: Vec<Vec<WriteBlock>>) -> Self {
        let mut next_index: BTreeMap<String, usize> = BTreeMap::new();
        for (r, blocks) in ranks.iter_mut().enumerate() {
            for block in blocks {
                block.rank = Rank(r);
                let idx = next_index.entry(block.name.clone()).or_insert(0);
                block.block_index = *idx;
                *idx += 1;
            }
        }
        Self {
            ranks,
            attributes: Attributes::new(),
        }
    }

    /// Pool what every writer contributed, in rank order.
    ///
    /// Blocks are pooled as by [`from_ranks`](Self::from_ranks);
    /// attributes are merged, the lowest rank winning a disagreement.
    pub fn from_writers(writers: Vec<WriterMetadata>) -> Self {
        let attributes = merge_attributes(writers.iter().map(|w| &w.attributes));
        Self {
            attributes,
            ..Self::from_ranks(writers.into_iter().map(|w| w.blocks).collect())
        }
    }

    /// Attributes published with this pattern.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Number of writer ranks.
    pub fn writer_count(&self) -> usize {
        self.ranks.len()
    }

    /// Blocks written by `rank` (empty for an unknown rank).
    pub fn rank(&self, rank: Rank) -> &[WriteBlock] {
        self.ranks.get(rank.0).map_or(&[][..], Vec::as_slice)
    }

    /// All blocks, in ascending rank order.
    pub fn blocks(&self) -> impl Iterator<Item = &WriteBlock> {
        self.ranks.iter().flatten()
    }

    /// All blocks of one variable, in block-index order.
    pub fn blocks_of<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a WriteBlock> + 'n
    where
        'a: 'n,
    {
        self.blocks().filter(move |b| b.name == name)
    }

    /// Block `index` of variable `name`.
    pub fn block(&self, name: &str, index: usize) -> Option<&WriteBlock> {
        self.blocks_of(name).find(|b| b.block_index == index)
    }

    /// Declared properties of `name`, taken from its first block.
    pub fn variable(&self, name: &str) -> Option<VariableInfo> {
        self.blocks_of(name).next().map(|b| VariableInfo {
            data_type: b.data_type,
            shape_kind: b.shape_kind,
            shape: b.shape.clone(),
        })
    }

    /// Names of all variables, sorted.
    pub fn variable_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.blocks().map(|b| b.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Serialized size of `rank`'s step buffer: control byte plus every
    /// block payload.
    pub fn payload_len(&self, rank: Rank) -> usize {
        1 + self.rank(rank).iter().map(|b| b.buffer_count).sum::<usize>()
    }
}

/// Read requests of a whole reader group, indexed by rank.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadPattern {
    ranks: Vec<Vec<ReadRequest>>,
}

impl ReadPattern {
    /// Pool per-rank request lists, stamping each with its rank.
    pub fn from_ranks(mut ranks: Vec<Vec<ReadRequest>>) -> Self {
        for (r, requests) in ranks.iter_mut().enumerate() {
            for req in requests {
                req.rank = Rank(r);
            }
        }
        Self { ranks }
    }

    /// Number of reader ranks.
    pub fn reader_count(&self) -> usize {
        self.ranks.len()
    }

    /// Requests issued by `rank` (empty for an unknown rank).
    pub fn rank(&self, rank: Rank) -> &[ReadRequest] {
        self.ranks.get(rank.0).map_or(&[][..], Vec::as_slice)
    }

    /// Reader ranks with their requests, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (Rank, &[ReadRequest])> {
        self.ranks
            .iter()
            .enumerate()
            .map(|(r, reqs)| (Rank(r), reqs.as_slice()))
    }
}
