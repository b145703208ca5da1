//! Selection wire encoding.
//!
//! Selections travel as compact JSON objects with short keys:
//!
//! | Key | Field |
//! |-----|-------|
//! | `T` | spatial type, `"all"` or `"box"` |
//! | `O`, `C` | box start and count |
//! | `B` | block id |
//! | `SS`, `SC` | step start and step count |
//! | `M` | memory selection `{O, C}` |
//! | `A` | accuracy `{E, N, R}` |
//! | `R` | stride |
//! | `K` | stencil `{S, W}` |
//!
//! Optional fields are omitted when unset. Decoding re-validates the
//! result, so a well-formed document describing an invalid selection is
//! rejected.

use serde::{Deserialize, Serialize};
use sluice_core::{BoxRegion, Dims};

use crate::error::SelectionError;
use crate::selection::{Accuracy, Selection, SpatialSelection, Stencil};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SpatialKind {
    All,
    Box,
}

#[derive(Serialize, Deserialize)]
struct BoxWire {
    #[serde(rename = "O")]
    start: Dims,
    #[serde(rename = "C")]
    count: Dims,
}

#[derive(Serialize, Deserialize)]
struct AccuracyWire {
    #[serde(rename = "E")]
    error: f64,
    #[serde(rename = "N")]
    norm: f64,
    #[serde(rename = "R")]
    relative: bool,
}

#[derive(Serialize, Deserialize)]
struct StencilWire {
    #[serde(rename = "S")]
    shape: Dims,
    #[serde(rename = "W")]
    weights: Vec<f64>,
}

fn one() -> u64 {
    1
}

#[derive(Serialize, Deserialize)]
struct SelectionWire {
    #[serde(rename = "T")]
    kind: SpatialKind,
    #[serde(rename = "O", default, skip_serializing_if = "Option::is_none")]
    start: Option<Dims>,
    #[serde(rename = "C", default, skip_serializing_if = "Option::is_none")]
    count: Option<Dims>,
    #[serde(rename = "B", default, skip_serializing_if = "Option::is_none")]
    block: Option<usize>,
    #[serde(rename = "SS", default)]
    step_start: u64,
    #[serde(rename = "SC", default = "one")]
    step_count: u64,
    #[serde(rename = "M", default, skip_serializing_if = "Option::is_none")]
    memory: Option<BoxWire>,
    #[serde(rename = "A", default, skip_serializing_if = "Option::is_none")]
    accuracy: Option<AccuracyWire>,
    #[serde(rename = "R", default, skip_serializing_if = "Option::is_none")]
    stride: Option<Dims>,
    #[serde(rename = "K", default, skip_serializing_if = "Option::is_none")]
    stencil: Option<StencilWire>,
}

/// Encode a selection to its JSON wire form.
pub fn encode_selection(sel: &Selection) -> Result<Vec<u8>, SelectionError> {
    let (kind, start, count) = match sel.spatial() {
        SpatialSelection::All => (SpatialKind::All, None, None),
        SpatialSelection::BoundingBox(b) => {
            (SpatialKind::Box, Some(b.start.clone()), Some(b.count.clone()))
        }
    };
    let accuracy = sel.accuracy();
    let wire = SelectionWire {
        kind,
        start,
        count,
        block: sel.block_id(),
        step_start: sel.step_start(),
        step_count: sel.step_count(),
        memory: sel.memory().map(|m| BoxWire {
            start: m.start.clone(),
            count: m.count.clone(),
        }),
        accuracy: (accuracy != Accuracy::default()).then_some(AccuracyWire {
            error: accuracy.error,
            norm: accuracy.norm,
            relative: accuracy.relative,
        }),
        stride: sel.stride().map(Dims::from_slice),
        stencil: sel.stencil().map(|k| StencilWire {
            shape: k.shape.clone(),
            weights: k.weights.clone(),
        }),
    };
    serde_json::to_vec(&wire).map_err(|e| SelectionError::Codec(e.to_string()))
}

/// Decode and validate a selection from its JSON wire form.
pub fn decode_selection(bytes: &[u8]) -> Result<Selection, SelectionError> {
    let wire: SelectionWire =
        serde_json::from_slice(bytes).map_err(|e| SelectionError::Codec(e.to_string()))?;

    let mut sel = match wire.kind {
        SpatialKind::All => Selection::all(),
        SpatialKind::Box => match (wire.start, wire.count) {
            (Some(start), Some(count)) => Selection::bounding_box(&start, &count)?,
            _ => {
                return Err(SelectionError::Codec(
                    "box selection without O/C".to_string(),
                ))
            }
        },
    };
    if let Some(block) = wire.block {
        sel.set_block(block)?;
    }
    sel.set_steps(wire.step_start, wire.step_count)?;
    if let Some(acc) = wire.accuracy {
        sel.set_accuracy(Accuracy {
            error: acc.error,
            norm: acc.norm,
            relative: acc.relative,
        })?;
    }
    if let Some(stride) = wire.stride {
        let stencil = wire
            .stencil
            .map(|k| Stencil::new(&k.shape, k.weights));
        sel.set_stride(&stride, stencil)?;
    } else if wire.stencil.is_some() {
        return Err(SelectionError::StencilWithoutStride);
    }
    if let Some(m) = wire.memory {
        let region = BoxRegion::new(&m.start, &m.count)?;
        sel.set_memory(&region.start, &region.count)?;
    }
    Ok(sel)
}
