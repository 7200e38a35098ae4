//! Property-based tests for schedules and clipping

use super::*;
use ndarray::Array1;
use proptest::prelude::*;

proptest! {
    /// Without warmup the schedule is a pure cosine from base to final
    #[test]
    fn prop_cosine_endpoints(
        base in 1e-6f64..1.0,
        final_value in 0.0f64..1e-3,
        epochs in 1usize..8,
        steps in 1usize..16,
    ) {
        let s = cosine_scheduler(base, final_value, epochs, steps, 0, 0.0);
        prop_assert_eq!(s.len(), epochs * steps);
        prop_assert!((s.at(0) - base).abs() < 1e-12);
        for v in s.values() {
            prop_assert!(*v <= base + 1e-12);
            prop_assert!(*v >= final_value - 1e-12);
        }
    }

    /// Warmup is non-decreasing and hands over at exactly the base value
    #[test]
    fn prop_warmup_monotone_then_base(
        base in 1e-4f64..1.0,
        warmup in 1usize..4,
        extra in 1usize..4,
        steps in 1usize..8,
    ) {
        let epochs = warmup + extra;
        let s = cosine_scheduler(base, 0.0, epochs, steps, warmup, 0.0);
        let w = warmup * steps;
        prop_assert!(s.values()[..w].windows(2).all(|p| p[1] >= p[0]));
        prop_assert!((s.at(w) - base).abs() < 1e-12);
    }

    /// Temperatures stay within [warmup, final] and never decrease
    #[test]
    fn prop_temperature_bounded(
        warm in 0.01f64..0.05,
        delta in 0.0f64..0.05,
        warmup_epochs in 0usize..10,
        extra in 0usize..10,
    ) {
        let fin = warm + delta;
        let epochs = warmup_epochs + extra;
        let t = TemperatureSchedule::new(warm, fin, warmup_epochs, epochs);
        prop_assert_eq!(t.len(), epochs);
        let mut prev = f64::NEG_INFINITY;
        for e in 0..epochs {
            let v = t.at(e);
            prop_assert!(v >= warm - 1e-12 && v <= fin + 1e-12);
            prop_assert!(v >= prev);
            prev = v;
        }
    }

    /// Clipped gradients never exceed the threshold
    #[test]
    fn prop_clip_bounds_each_norm(
        values in prop::collection::vec(-100.0f32..100.0, 1..32),
        max_norm in 0.1f32..10.0,
    ) {
        let mut params = vec![Tensor::zeros(&[values.len()], true)];
        params[0].set_grad(Array1::from(values));
        clip_gradients(&mut params, max_norm);
        let g = params[0].grad().unwrap();
        prop_assert!(g.dot(g).sqrt() <= max_norm * 1.0001);
    }
}

#[test]
fn test_build_optimizer_by_name() {
    let names = vec!["w".to_string(), "b".to_string()];
    let params = vec![Tensor::zeros(&[2, 2], true), Tensor::zeros(&[2], true)];
    for name in ["adamw", "sgd", "lars", "AdamW"] {
        let opt = build_optimizer(name, &names, &params).unwrap();
        assert_eq!(opt.param_groups().len(), 2);
    }
    assert!(build_optimizer("adagrad", &names, &params).is_err());
}

#[test]
fn test_weight_decay_only_on_first_group() {
    let names = vec!["w".to_string(), "b".to_string()];
    let params = vec![Tensor::zeros(&[2, 2], true), Tensor::zeros(&[2], true)];
    let mut opt = build_optimizer("adamw", &names, &params).unwrap();
    opt.set_lr(0.1);
    opt.set_weight_decay(0.04);
    assert_eq!(opt.param_groups()[0].weight_decay, 0.04);
    assert_eq!(opt.param_groups()[1].weight_decay, 0.0);
    assert!(opt.param_groups().iter().all(|g| g.lr == 0.1));
}
