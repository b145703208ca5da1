//! End-to-end streams over the in-process fabric.

use sluice_comm::OperatorRegistry;
use sluice_core::{DataType, Rank};
use sluice_engine::{
    EngineError, EngineKind, StepMetrics, StepStatus, StreamConfig, StreamReader, StreamWriter,
};
use sluice_pattern::{AttributeValue, OperatorSpec, PatternError};
use sluice_select::{Selection, Stencil};
use sluice_test_utils::fixtures::{ramp, row_decomposition, RejectingOperator, RleOperator};
use sluice_test_utils::{run_stream, test_config, COLLECTIVE_TIMEOUT};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

const SHAPE: [usize; 2] = [8, 4];

fn define_field(w: &mut StreamWriter) {
    w.define_variable("field", DataType::Float64, &SHAPE).unwrap();
}

fn put_rows(w: &mut StreamWriter, step: u64, writers: usize) {
    let (start, count) = row_decomposition(SHAPE[0], SHAPE[1], writers, w.rank().0);
    w.put_sync("field", &start, &count, &ramp(step, &SHAPE, &start, &count))
        .unwrap();
}

/// Run `steps` writer steps, calling `on_step` inside each, then close.
fn write_steps(
    mut w: StreamWriter,
    steps: u64,
    mut on_step: impl FnMut(&mut StreamWriter, u64),
) -> Vec<StepMetrics> {
    let mut metrics = Vec::new();
    for step in 0..steps {
        assert_eq!(w.begin_step().unwrap(), StepStatus::Ok);
        on_step(&mut w, step);
        metrics.push(w.end_step().unwrap());
    }
    w.close().unwrap();
    metrics
}

/// Read until end of stream, calling `on_step` inside each step, then
/// close.
fn read_steps(
    mut r: StreamReader,
    mut on_step: impl FnMut(&mut StreamReader, u64),
) -> Vec<StepMetrics> {
    let mut metrics = Vec::new();
    loop {
        match r.begin_step(Some(COLLECTIVE_TIMEOUT)).unwrap() {
            StepStatus::Ok => {}
            StepStatus::EndOfStream => break,
            StepStatus::NotReady => panic!("step not published within the timeout"),
        }
        let step = r.current_step().unwrap().0;
        on_step(&mut r, step);
        metrics.push(r.end_step().unwrap());
    }
    r.close().unwrap();
    metrics
}

fn fast_flags(metrics: &[StepMetrics]) -> Vec<bool> {
    metrics.iter().map(|m| m.fast_path).collect()
}

fn read_box(r: &mut StreamReader, step: u64, start: [usize; 2], count: [usize; 2]) {
    let sel = Selection::bounding_box(&start, &count).unwrap();
    let got: Vec<f64> = r.get_sync("field", &sel).unwrap();
    assert_eq!(got, ramp(step, &SHAPE, &start, &count), "step {step}");
}

#[test]
fn full_exchange_round_trip() {
    let (_, readers) = run_stream(
        2,
        2,
        test_config("round-trip"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.define_variable("aux", DataType::Float64, &[2]).unwrap();
            if w.rank() == Rank(0) {
                w.define_value("time", DataType::Float64).unwrap();
            }
            write_steps(w, 3, |w, step| {
                put_rows(w, step, 2);
                let r = w.rank().0;
                w.put_deferred("aux", &[r], &[1], vec![step as f64 * 10.0 + r as f64])
                    .unwrap();
                if w.rank() == Rank(0) {
                    w.put_value("time", step as f64 * 0.5).unwrap();
                }
            })
        },
        |r| {
            read_steps(r, |r, step| {
                // Reader 0 straddles the writer boundary, reader 1 does
                // too with an offset column range.
                if r.rank() == Rank(0) {
                    read_box(r, step, [1, 0], [4, 4]);
                } else {
                    read_box(r, step, [3, 1], [5, 2]);
                }
                let aux = r.get_deferred::<f64>("aux", &Selection::all()).unwrap();
                let time: Vec<f64> = r.get_sync("time", &Selection::all()).unwrap();
                assert_eq!(time, vec![step as f64 * 0.5]);
                r.perform_gets().unwrap();
                assert_eq!(
                    r.take(aux).unwrap(),
                    vec![step as f64 * 10.0, step as f64 * 10.0 + 1.0]
                );
            })
        },
    );
    for metrics in readers {
        assert_eq!(metrics.len(), 3);
        assert!(metrics.iter().all(|m| !m.fast_path));
        assert!(metrics.iter().all(|m| m.window_fetches == 2));
    }
}

fn locked_run(threading: bool) {
    let config = test_config("locked").with_threading(threading);
    let (writers, readers) = run_stream(
        2,
        2,
        config,
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.lock_layout();
            write_steps(w, 5, |w, step| put_rows(w, step, 2))
        },
        |mut r| {
            r.lock_layout();
            read_steps(r, |r, step| {
                let start = if r.rank() == Rank(0) { [0, 0] } else { [2, 1] };
                read_box(r, step, start, [5, 3]);
            })
        },
    );
    let expected = vec![false, false, true, true, true];
    for w in &writers {
        assert_eq!(fast_flags(w), expected);
    }
    for r in &readers {
        assert_eq!(fast_flags(r), expected);
        assert!(r[2..].iter().all(|m| m.window_fetches == 0));
        assert!(r.iter().all(|m| m.layout_conflicts == 0));
    }
}

#[test]
fn locked_layout_takes_fast_path() {
    locked_run(false);
}

#[test]
fn locked_layout_takes_fast_path_with_threaded_finalize() {
    locked_run(true);
}

#[test]
fn naive_engine_never_takes_fast_path() {
    let config = test_config("naive").with_kind(EngineKind::Naive);
    let (writers, readers) = run_stream(
        1,
        1,
        config,
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.lock_layout();
            write_steps(w, 4, |w, step| put_rows(w, step, 1))
        },
        |mut r| {
            r.lock_layout();
            read_steps(r, |r, step| read_box(r, step, [0, 0], [8, 4]))
        },
    );
    assert!(fast_flags(&writers[0]).iter().all(|f| !f));
    assert!(fast_flags(&readers[0]).iter().all(|f| !f));
}

#[test]
fn writer_layout_change_unlocks_and_recovers() {
    let (writers, readers) = run_stream(
        2,
        1,
        test_config("relayout"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.lock_layout();
            let rank = w.rank().0;
            let mut metrics = Vec::new();
            for step in 0..6u64 {
                w.begin_step().unwrap();
                if step < 3 {
                    put_rows(&mut w, step, 2);
                } else {
                    // Uneven split from step 3 on: rows 0..6 and 6..8.
                    let (start, count) = if rank == 0 {
                        ([0, 0], [6, 4])
                    } else {
                        ([6, 0], [2, 4])
                    };
                    w.put_sync("field", &start, &count, &ramp(step, &SHAPE, &start, &count))
                        .unwrap();
                }
                metrics.push(w.end_step().unwrap());
                if step == 3 {
                    assert!(!w.is_locked());
                    w.lock_layout();
                }
            }
            w.close().unwrap();
            metrics
        },
        |mut r| {
            r.lock_layout();
            read_steps(r, |r, step| read_box(r, step, [4, 0], [4, 4]))
        },
    );
    for w in &writers {
        assert_eq!(fast_flags(w), vec![false, false, true, false, true, true]);
        assert_eq!(w[3].layout_conflicts, 1);
    }
    assert_eq!(
        fast_flags(&readers[0]),
        vec![false, false, true, false, true, true]
    );
}

#[test]
fn conflict_in_final_step_is_reported_by_close() {
    let (writers, _) = run_stream(
        1,
        1,
        test_config("final-conflict"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.lock_layout();
            for step in 0..3u64 {
                w.begin_step().unwrap();
                if step == 2 {
                    w.define_variable("field", DataType::Float64, &[4, 4]).unwrap();
                    w.put_sync("field", &[0, 0], &[4, 4], &ramp(step, &[4, 4], &[0, 0], &[4, 4]))
                        .unwrap();
                } else {
                    put_rows(&mut w, step, 1);
                }
                w.end_step().unwrap();
            }
            w.close()
        },
        |r| {
            read_steps(r, |r, step| {
                let got: Vec<f64> = r.get_sync("field", &Selection::all()).unwrap();
                let shape = if step == 2 { [4, 4] } else { SHAPE };
                assert_eq!(got, ramp(step, &shape, &[0, 0], &shape));
            })
        },
    );
    match &writers[0] {
        Err(EngineError::Protocol {
            source: PatternError::LayoutConflict { variable, .. },
            ..
        }) => assert_eq!(variable, "field"),
        other => panic!("expected LayoutConflict from close, got {other:?}"),
    }
}

#[test]
fn reader_selection_change_under_lock_falls_back_to_fetch() {
    let (_, readers) = run_stream(
        2,
        1,
        test_config("reader-conflict"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.lock_layout();
            write_steps(w, 5, |w, step| put_rows(w, step, 2))
        },
        |mut r| {
            r.lock_layout();
            read_steps(r, |r, step| {
                if step < 3 {
                    // Rows 0..2 live on writer 0 only.
                    read_box(r, step, [0, 0], [2, 4]);
                } else {
                    read_box(r, step, [2, 0], [4, 4]);
                }
            })
        },
    );
    let m = &readers[0];
    assert_eq!(fast_flags(m), vec![false, false, true, true, false]);
    assert_eq!(m[3].layout_conflicts, 1);
    assert_eq!(m[3].window_fetches, 1);
    assert_eq!(m[4].layout_conflicts, 0);
}

#[test]
fn reader_conflict_names_the_changed_selection() {
    let (_, readers) = run_stream(
        1,
        1,
        test_config("reader-conflict-name"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.define_variable("aux", DataType::Float64, &[4]).unwrap();
            w.lock_layout();
            write_steps(w, 3, |w, step| {
                put_rows(w, step, 1);
                w.put_sync("aux", &[0], &[4], &[step as f64; 4]).unwrap();
            })
        },
        |mut r| {
            r.lock_layout();
            let mut steps = 0;
            while r.begin_step(Some(COLLECTIVE_TIMEOUT)).unwrap() == StepStatus::Ok {
                let step = r.current_step().unwrap().0;
                read_box(&mut r, step, [0, 0], [8, 4]);
                let count = if step == 2 { 2 } else { 4 };
                let sel = Selection::bounding_box(&[0], &[count]).unwrap();
                let aux: Vec<f64> = r.get_sync("aux", &sel).unwrap();
                assert_eq!(aux, vec![step as f64; count]);
                r.end_step().unwrap();
                steps += 1;
            }
            (steps, r.close())
        },
    );
    let (steps, closed) = &readers[0];
    assert_eq!(*steps, 3);
    match closed {
        Err(EngineError::Protocol {
            source: PatternError::LayoutConflict { variable, .. },
            ..
        }) => assert_eq!(variable, "aux"),
        other => panic!("expected LayoutConflict from close, got {other:?}"),
    }
}

#[test]
fn operator_failure_in_final_step_still_ends_the_stream() {
    let mut operators = OperatorRegistry::new();
    operators.register(Arc::new(RejectingOperator));
    let (writers, readers) = run_stream(
        1,
        1,
        test_config("final-step-failure"),
        operators,
        |mut w| {
            define_field(&mut w);
            for step in 0..3u64 {
                w.begin_step().unwrap();
                if step == 2 {
                    w.set_operator(
                        "field",
                        OperatorSpec {
                            name: "reject".into(),
                            params: Default::default(),
                        },
                    )
                    .unwrap();
                    let (start, count) = row_decomposition(SHAPE[0], SHAPE[1], 1, 0);
                    w.put_deferred("field", &start, &count, ramp(step, &SHAPE, &start, &count))
                        .unwrap();
                    break;
                }
                put_rows(&mut w, step, 1);
                w.end_step().unwrap();
            }
            w.close()
        },
        |r| read_steps(r, |r, step| read_box(r, step, [0, 0], [8, 4])),
    );
    match &writers[0] {
        Err(EngineError::Operator(_)) => {}
        other => panic!("expected Operator error from close, got {other:?}"),
    }
    assert_eq!(readers[0].len(), 2);
}

#[test]
fn attributes_reach_readers_with_full_exchanges() {
    let (writers, readers) = run_stream(
        2,
        1,
        test_config("attributes"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            if w.rank() == Rank(0) {
                w.define_attribute("units", "K").unwrap();
            }
            w.define_attribute("shape", vec![8i64, 4]).unwrap();
            w.lock_layout();
            write_steps(w, 5, |w, step| {
                if step == 3 && w.rank() == Rank(1) {
                    w.define_attribute("dt", 0.25f64).unwrap();
                }
                put_rows(w, step, 2);
            })
        },
        |mut r| {
            r.lock_layout();
            read_steps(r, |r, step| {
                let attrs = r.attributes().unwrap();
                assert_eq!(attrs["units"].as_text(), Some("K"));
                assert_eq!(attrs["shape"], AttributeValue::Int(vec![8, 4]));
                assert_eq!(attrs.get("dt").is_some(), step >= 3, "step {step}");
                read_box(r, step, [0, 0], [8, 4]);
            })
        },
    );
    for m in writers.iter().chain(&readers) {
        assert_eq!(fast_flags(m), vec![false, false, true, false, true]);
        assert!(m.iter().all(|m| m.layout_conflicts == 0));
    }
}

#[test]
fn streams_without_attributes_report_none() {
    let (_, readers) = run_stream(
        1,
        1,
        test_config("no-attributes"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            write_steps(w, 2, |w, step| put_rows(w, step, 1))
        },
        |r| {
            read_steps(r, |r, step| {
                assert!(r.attributes().unwrap().is_empty());
                read_box(r, step, [0, 0], [8, 4]);
            })
        },
    );
    assert_eq!(readers[0].len(), 2);
}

#[test]
fn string_values_change_length_between_steps() {
    let label = |step: u64| format!("step {step}: {}", "~".repeat(step as usize * 3));
    let (_, readers) = run_stream(
        2,
        1,
        test_config("strings"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            if w.rank() == Rank(0) {
                w.define_value("label", DataType::String).unwrap();
            }
            write_steps(w, 4, |w, step| {
                put_rows(w, step, 2);
                if w.rank() == Rank(0) {
                    w.put_string("label", &label(step)).unwrap();
                }
            })
        },
        |r| {
            read_steps(r, |r, step| {
                let vars = r.available_variables().unwrap();
                let (_, info) = vars.iter().find(|(name, _)| name == "label").unwrap();
                assert_eq!(info.data_type, DataType::String);
                assert_eq!(r.get_string("label").unwrap(), label(step));
                match r.get_sync::<u8>("label", &Selection::all()) {
                    Err(EngineError::Protocol {
                        source: PatternError::TypeMismatch { .. },
                        ..
                    }) => {}
                    other => panic!("expected TypeMismatch, got {other:?}"),
                }
                read_box(r, step, [2, 0], [4, 4]);
            })
        },
    );
    assert_eq!(readers[0].len(), 4);
}

#[test]
fn end_of_stream_wins_over_long_timeout() {
    let (_, readers) = run_stream(
        1,
        1,
        test_config("eos"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            write_steps(w, 1, |w, step| put_rows(w, step, 1))
        },
        |mut r| {
            assert_eq!(r.begin_step(Some(Duration::from_secs(120))).unwrap(), StepStatus::Ok);
            read_box(&mut r, 0, [0, 0], [8, 4]);
            r.end_step().unwrap();
            let started = Instant::now();
            let status = r.begin_step(Some(Duration::from_secs(120))).unwrap();
            let waited = started.elapsed();
            r.close().unwrap();
            (status, waited)
        },
    );
    let (status, waited) = readers[0];
    assert_eq!(status, StepStatus::EndOfStream);
    assert!(waited < Duration::from_secs(60), "waited {waited:?}");
}

#[test]
fn poll_reports_not_ready_before_first_step() {
    let gate = Arc::new(Barrier::new(2));
    let (_, readers) = run_stream(
        1,
        1,
        test_config("poll"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            gate.wait();
            write_steps(w, 1, |w, step| put_rows(w, step, 1))
        },
        |mut r| {
            let first = r.begin_step(Some(Duration::from_millis(10))).unwrap();
            let state = r.state();
            gate.wait();
            let metrics = read_steps(r, |r, step| read_box(r, step, [0, 0], [8, 4]));
            (first, state, metrics.len())
        },
    );
    assert_eq!(
        readers[0],
        (StepStatus::NotReady, sluice_engine::StepState::NotStarted, 1)
    );
}

#[test]
fn strided_stencil_read_spans_writers() {
    let (_, readers) = run_stream(
        2,
        1,
        test_config("stencil"),
        OperatorRegistry::new(),
        |mut w| {
            w.define_variable("line", DataType::Float64, &[7]).unwrap();
            write_steps(w, 1, |w, _| {
                if w.rank() == Rank(0) {
                    w.put_sync("line", &[0], &[4], &[0.0f64, 1.0, 2.0, 3.0]).unwrap();
                } else {
                    w.put_sync("line", &[4], &[3], &[4.0f64, 5.0, 6.0]).unwrap();
                }
            })
        },
        |r| {
            let mut out = Vec::new();
            read_steps(r, |r, _| {
                let sel = Selection::all()
                    .with_stride(&[2], Some(Stencil::new(&[3], vec![0.25, 0.5, 0.25])))
                    .unwrap();
                out = r.get_sync::<f64>("line", &sel).unwrap();
            });
            out
        },
    );
    let out = &readers[0];
    let expected = [1.0 / 3.0, 2.0, 4.0, 17.0 / 3.0];
    assert_eq!(out.len(), expected.len());
    for (got, want) in out.iter().zip(expected) {
        assert!((got - want).abs() < 1e-12, "{out:?}");
    }
}

#[test]
fn block_selection_reads_one_writer() {
    let (_, readers) = run_stream(
        4,
        1,
        test_config("block"),
        OperatorRegistry::new(),
        |mut w| {
            w.define_variable("v", DataType::Float64, &[100]).unwrap();
            write_steps(w, 2, |w, step| {
                let start = [w.rank().0 * 25];
                w.put_sync("v", &start, &[25], &ramp(step, &[100], &start, &[25]))
                    .unwrap();
            })
        },
        |r| {
            read_steps(r, |r, step| {
                let info = r.blocks_info("v").unwrap();
                assert_eq!(info.len(), 4);
                assert_eq!(info[2].writer, Rank(2));
                assert_eq!(info[2].start.as_slice(), &[50]);

                let whole: Vec<f64> = r.get_sync("v", &Selection::block(2)).unwrap();
                assert_eq!(whole, ramp(step, &[100], &[50], &[25]));
                let part: Vec<f64> = r
                    .get_sync("v", &Selection::block(2).with_bounding_box(&[5], &[3]).unwrap())
                    .unwrap();
                assert_eq!(part, ramp(step, &[100], &[55], &[3]));
            })
        },
    );
    assert!(readers[0].iter().all(|m| m.window_fetches == 1));
}

#[test]
fn missing_block_is_a_layout_conflict() {
    let (_, readers) = run_stream(
        1,
        1,
        test_config("missing-block"),
        OperatorRegistry::new(),
        |mut w| {
            w.define_variable("v", DataType::Float64, &[4]).unwrap();
            write_steps(w, 1, |w, _| w.put_sync("v", &[0], &[4], &[0.0f64; 4]).unwrap())
        },
        |r| {
            let mut result = None;
            read_steps(r, |r, _| {
                result = Some(r.get_sync::<f64>("v", &Selection::block(3)));
            });
            result
        },
    );
    match &readers[0] {
        Some(Err(EngineError::Protocol {
            source: PatternError::LayoutConflict { .. },
            ..
        })) => {}
        other => panic!("expected LayoutConflict, got {other:?}"),
    }
}

#[test]
fn operator_payloads_are_transparent_to_readers() {
    let mut operators = OperatorRegistry::new();
    operators.register(Arc::new(RleOperator));
    let spiky = |step: u64, start: &[usize], count: &[usize]| -> Vec<f64> {
        ramp(step, &SHAPE, start, count)
            .into_iter()
            .map(|v| if v as u64 % 4 == 0 { v } else { 0.0 })
            .collect()
    };
    let (_, readers) = run_stream(
        2,
        1,
        test_config("operator"),
        operators,
        |mut w| {
            define_field(&mut w);
            w.set_operator(
                "field",
                OperatorSpec {
                    name: "rle".into(),
                    params: Default::default(),
                },
            )
            .unwrap();
            write_steps(w, 2, |w, step| {
                let (start, count) = row_decomposition(8, 4, 2, w.rank().0);
                w.put_sync("field", &start, &count, &spiky(step, &start, &count))
                    .unwrap();
            })
        },
        |r| {
            read_steps(r, |r, step| {
                let got: Vec<f64> = r.get_sync("field", &Selection::all()).unwrap();
                assert_eq!(got, spiky(step, &[0, 0], &SHAPE));
            })
        },
    );
    let raw = 2 * (1 + 16 * 8) as u64;
    assert!(readers[0].iter().all(|m| m.bytes_received < raw));
}

#[test]
fn unknown_operator_is_rejected_at_definition() {
    let (writers, _) = run_stream(
        1,
        1,
        test_config("no-operator"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            let err = w.set_operator(
                "field",
                OperatorSpec {
                    name: "zfp".into(),
                    params: Default::default(),
                },
            );
            w.close().unwrap();
            err
        },
        |r| read_steps(r, |_, _| {}),
    );
    assert!(matches!(writers[0], Err(EngineError::Operator(_))));
}

#[test]
fn readers_leaving_early_do_not_stall_writers() {
    let (writers, _) = run_stream(
        1,
        1,
        test_config("departure"),
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            write_steps(w, 3, |w, step| put_rows(w, step, 1))
        },
        |mut r| {
            assert_eq!(r.begin_step(Some(COLLECTIVE_TIMEOUT)).unwrap(), StepStatus::Ok);
            read_box(&mut r, 0, [0, 0], [8, 4]);
            r.end_step().unwrap();
            r.close().unwrap();
        },
    );
    assert_eq!(writers[0].len(), 3);
}

#[test]
fn from_params_configures_a_stream() {
    let params = [("EngineMode", "naive"), ("Threading", "yes")]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = StreamConfig::from_params("params", &params).unwrap();
    let (writers, _) = run_stream(
        1,
        1,
        config,
        OperatorRegistry::new(),
        |mut w| {
            define_field(&mut w);
            w.lock_layout();
            write_steps(w, 3, |w, step| put_rows(w, step, 1))
        },
        |mut r| {
            r.lock_layout();
            read_steps(r, |r, step| read_box(r, step, [0, 0], [8, 4]))
        },
    );
    assert!(fast_flags(&writers[0]).iter().all(|f| !f));
}
