//! The facade is transparent: results, errors and checkpoints pass through

mod common;

use common::mock_helpers::{counting_upstream, MockDataset, MockUpstream};
use mockall::predicate::always;
use pipeline_autotune::autotune::ControllerState;
use pipeline_autotune::prelude::*;
use pipeline_autotune::AutotuneError;

fn options() -> AutotuneOptions {
    AutotuneOptions::new()
        .with_cpu_budget(2)
        .with_ram_budget(1 << 20)
}

#[test]
fn test_elements_pass_through_unchanged() {
    let ctx = IteratorContext::default();
    let dataset = MockDataset::new(counting_upstream(5)).autotune(options()).unwrap();
    let mut it = dataset.make_iterator(&ctx).unwrap();

    let mut out = Vec::new();
    while let Some(x) = it.get_next(&ctx).unwrap() {
        out.push(x);
    }
    assert_eq!(out, vec![0, 1, 2, 3, 4]);
    assert_eq!(it.num_input_events(), 5);
    assert_eq!(it.model().num_nodes(), 1);
}

#[test]
fn test_upstream_errors_are_forwarded_unchanged() {
    let ctx = IteratorContext::default();
    let mut upstream = MockUpstream::new();
    let mut calls = 0;
    upstream.expect_get_next().times(3).returning(move |_| {
        calls += 1;
        match calls {
            1 => Ok(Some(7)),
            2 => Err(AutotuneError::Upstream("disk on fire".to_string())),
            _ => Ok(None),
        }
    });

    let dataset = MockDataset::new(upstream).autotune(options()).unwrap();
    let mut it = dataset.make_iterator(&ctx).unwrap();
    assert_eq!(it.get_next(&ctx).unwrap(), Some(7));
    match it.get_next(&ctx) {
        Err(AutotuneError::Upstream(message)) => assert_eq!(message, "disk on fire"),
        other => panic!("expected upstream error, got {:?}", other),
    }
    assert_eq!(it.get_next(&ctx).unwrap(), None);
    // The failed call still completed a request.
    assert_eq!(it.num_input_events(), 2);
}

#[test]
fn test_checkpoint_calls_are_delegated() {
    let ctx = IteratorContext::default();
    let mut upstream = MockUpstream::new();
    upstream.expect_get_next().returning(|_| Ok(Some(1)));
    upstream
        .expect_save()
        .times(1)
        .returning(|checkpoint: &mut Checkpoint| checkpoint.write("Upstream", "position", &42u64));
    upstream
        .expect_restore()
        .with(always(), always())
        .times(1)
        .returning(|_, checkpoint: &Checkpoint| {
            let position: u64 = checkpoint.read("Upstream", "position")?;
            assert_eq!(position, 42);
            Ok(())
        });

    let dataset = MockDataset::new(upstream).autotune(options()).unwrap();
    let mut it = dataset.make_iterator(&ctx).unwrap();
    it.get_next(&ctx).unwrap();

    let mut checkpoint = Checkpoint::new();
    it.save(&mut checkpoint).unwrap();
    assert_eq!(checkpoint.keys().count(), 1);
    it.restore(&ctx, &checkpoint).unwrap();

    // Checkpointing leaves the controller running.
    assert_eq!(it.controller_state(), ControllerState::Running);
}

#[test]
fn test_restore_errors_propagate() {
    let ctx = IteratorContext::default();
    let mut upstream = MockUpstream::new();
    upstream
        .expect_restore()
        .returning(|_, checkpoint: &Checkpoint| checkpoint.read::<u64>("Upstream", "position").map(|_| ()));

    let dataset = MockDataset::new(upstream).autotune(options()).unwrap();
    let mut it = dataset.make_iterator(&ctx).unwrap();
    let err = it.restore(&ctx, &Checkpoint::new()).unwrap_err();
    assert!(matches!(err.root(), AutotuneError::Checkpoint(_)));
}

#[test]
fn test_make_iterator_errors_propagate() {
    let ctx = IteratorContext::default();
    let dataset = std::sync::Arc::new(
        MockDataset::new(counting_upstream(1)).autotune(options()).unwrap(),
    );
    assert!(dataset.make_iterator(&ctx).is_ok());
    let err = dataset.make_iterator(&ctx).unwrap_err();
    assert!(err.is_configuration());
}
