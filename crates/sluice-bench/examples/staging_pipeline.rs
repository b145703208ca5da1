//! End-to-end staging example.
//!
//! Demonstrates: open writer and reader engines on one fabric → lock
//! both layouts → stream steps → read a smoothed, downsampled view →
//! close.

use sluice_comm::{LocalFabric, LocalGroup, OperatorRegistry};
use sluice_core::DataType;
use sluice_engine::{Engine, StepEngine, StepMode, StepStatus, StreamConfig};
use sluice_select::Selection;
use std::sync::Arc;
use std::thread;

const WRITERS: usize = 2;
const ROWS: usize = 16;
const COLS: usize = 8;
const STEPS: u64 = 6;

fn main() {
    println!("=== Sluice Staging Pipeline Example ===\n");

    let fabric = LocalFabric::new(WRITERS, 1);
    let config = StreamConfig::new("staging").with_threading(true);

    let writers: Vec<_> = LocalGroup::create(WRITERS)
        .into_iter()
        .map(|group| {
            let mut engine = Engine::open(
                StepMode::Append,
                config.clone(),
                Arc::new(group),
                fabric.clone(),
                OperatorRegistry::new(),
            )
            .unwrap();
            thread::spawn(move || {
                let w = engine.as_writer().unwrap();
                w.define_variable("temperature", DataType::Float64, &[ROWS, COLS])
                    .unwrap();
                w.define_value("time", DataType::Float64).unwrap();
                w.lock_layout();
                let rows = ROWS / WRITERS;
                let first = w.rank().0 * rows;
                for step in 0..STEPS {
                    w.begin_step().unwrap();
                    let data: Vec<f64> = (0..rows * COLS)
                        .map(|i| ((first * COLS + i) as f64) + step as f64 * 0.5)
                        .collect();
                    w.put_sync("temperature", &[first, 0], &[rows, COLS], &data)
                        .unwrap();
                    w.put_value("time", step as f64 * 0.1).unwrap();
                    w.end_step().unwrap();
                }
                engine.close().unwrap();
            })
        })
        .collect();

    let mut reader = Engine::open(
        StepMode::Read,
        config,
        Arc::new(LocalGroup::create(1).remove(0)),
        fabric,
        OperatorRegistry::new(),
    )
    .unwrap();
    if let Some(r) = reader.as_reader() {
        r.lock_layout();
    }

    let view = Selection::all()
        .with_stride(
            &[4, 4],
            Some(sluice_select::Stencil::new(&[3, 3], vec![1.0 / 9.0; 9])),
        )
        .unwrap();

    loop {
        match reader.begin_step(StepMode::Read, None).unwrap() {
            StepStatus::Ok => {}
            StepStatus::EndOfStream => break,
            StepStatus::NotReady => continue,
        }
        let r = reader.as_reader().unwrap();
        let time: Vec<f64> = r.get_sync("time", &Selection::all()).unwrap();
        let coarse: Vec<f64> = r.get_sync("temperature", &view).unwrap();
        let metrics = reader.end_step().unwrap();
        println!(
            "step {} t={:.1} fast={} fetches={} coarse={:?}",
            metrics.step,
            time[0],
            metrics.fast_path,
            metrics.window_fetches,
            &coarse[..4]
        );
    }
    reader.close().unwrap();

    for handle in writers {
        handle.join().unwrap();
    }
    println!("\nStream closed after {STEPS} steps.");
}
