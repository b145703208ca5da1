//! Test harnesses and fixtures for Sluice development.
//!
//! [`run_stream`] wires a writer group and a reader group together over
//! an in-process [`LocalFabric`], one thread per rank, and hands each
//! thread its opened engine. The [`fixtures`] module provides block
//! decompositions, deterministic data, and a reference operator.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use sluice_comm::{Collective, LocalFabric, LocalGroup, OperatorRegistry};
use sluice_engine::{StreamConfig, StreamReader, StreamWriter};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Bound on every group collective inside the harness, so a protocol
/// bug fails the test instead of hanging it.
pub const COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Test configuration: named `name`, transfers bounded by
/// [`COLLECTIVE_TIMEOUT`].
pub fn test_config(name: &str) -> StreamConfig {
    StreamConfig::new(name).with_transfer_timeout(Some(COLLECTIVE_TIMEOUT))
}

/// Run `writers` writer ranks and `readers` reader ranks of one stream,
/// each on its own thread, and collect their results by rank.
///
/// Panics (failing the test) if any rank panics or fails to open.
pub fn run_stream<W, R>(
    writers: usize,
    readers: usize,
    config: StreamConfig,
    operators: OperatorRegistry,
    writer: impl Fn(StreamWriter) -> W + Sync,
    reader: impl Fn(StreamReader) -> R + Sync,
) -> (Vec<W>, Vec<R>)
where
    W: Send,
    R: Send,
{
    let fabric = LocalFabric::new(writers, readers);
    let writer_groups = LocalGroup::create_with_timeout(writers, Some(COLLECTIVE_TIMEOUT));
    let reader_groups = LocalGroup::create_with_timeout(readers, Some(COLLECTIVE_TIMEOUT));

    thread::scope(|s| {
        let writer_threads: Vec<_> = writer_groups
            .into_iter()
            .map(|group| {
                let (fabric, config, operators, writer) =
                    (fabric.clone(), config.clone(), operators.clone(), &writer);
                thread::Builder::new()
                    .name(format!("writer-{}", group.rank()))
                    .spawn_scoped(s, move || {
                        let w = StreamWriter::open(config, Arc::new(group), fabric)
                            .expect("writer open")
                            .with_operators(operators);
                        writer(w)
                    })
                    .expect("spawn writer")
            })
            .collect();
        let reader_threads: Vec<_> = reader_groups
            .into_iter()
            .map(|group| {
                let (fabric, config, operators, reader) =
                    (fabric.clone(), config.clone(), operators.clone(), &reader);
                thread::Builder::new()
                    .name(format!("reader-{}", group.rank()))
                    .spawn_scoped(s, move || {
                        let r = StreamReader::open(config, Arc::new(group), fabric)
                            .expect("reader open")
                            .with_operators(operators);
                        reader(r)
                    })
                    .expect("spawn reader")
            })
            .collect();

        let w = writer_threads
            .into_iter()
            .map(|t| t.join().expect("writer thread panicked"))
            .collect();
        let r = reader_threads
            .into_iter()
            .map(|t| t.join().expect("reader thread panicked"))
            .collect();
        (w, r)
    })
}
