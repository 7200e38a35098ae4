//! Property tests for YAML schema serialization and validation

#[cfg(test)]
mod tests {
    use crate::config::schema::*;
    use crate::config::validate::{validate_config, ValidationError};
    use crate::masking::OverflowPolicy;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn known() -> Vec<String> {
        ["timesformer", "vit_base", "vit_small", "vit_tiny"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    // ============================================================
    // Arbitrary Generators
    // ============================================================

    fn arb_arch() -> impl Strategy<Value = String> {
        prop_oneof!["vit_tiny", "vit_small", "vit_base", "deit_small", "timesformer"]
            .prop_map(String::from)
    }

    fn arb_optimizer_name() -> impl Strategy<Value = String> {
        prop_oneof!["adamw", "sgd", "lars"].prop_map(String::from)
    }

    fn arb_overflow() -> impl Strategy<Value = OverflowPolicy> {
        prop_oneof![
            Just(OverflowPolicy::Clamp),
            Just(OverflowPolicy::Error),
            Just(OverflowPolicy::Widen)
        ]
    }

    fn arb_model() -> impl Strategy<Value = ModelSpec> {
        (arb_arch(), prop_oneof![Just(8usize), Just(16)], 1usize..4096, any::<bool>(), 0.9f64..1.0)
            .prop_map(|(arch, patch_size, out_dim, norm_last_layer, momentum_teacher)| ModelSpec {
                arch,
                patch_size,
                out_dim,
                norm_last_layer,
                momentum_teacher,
                ..ModelSpec::default()
            })
    }

    fn arb_optim() -> impl Strategy<Value = OptimSpec> {
        (arb_optimizer_name(), 1e-6f64..1.0, 0usize..5, 0.0f32..10.0, any::<bool>()).prop_map(
            |(name, lr, warmup_epochs, clip_grad, use_fp16)| OptimSpec {
                name,
                lr,
                warmup_epochs,
                clip_grad,
                use_fp16,
                ..OptimSpec::default()
            },
        )
    }

    fn arb_masking() -> impl Strategy<Value = MaskingSpec> {
        (0.0f64..0.99, 0.01f64..=1.0, 0usize..4, arb_overflow(), 0.0f64..0.99).prop_map(
            |(ratio, threshold, bottom_visible, overflow, tube_ratio)| MaskingSpec {
                ratio,
                threshold,
                bottom_visible,
                overflow,
                tube_ratio,
            },
        )
    }

    fn arb_training() -> impl Strategy<Value = TrainingParams> {
        (5usize..200, 1usize..20, any::<u64>(), 1usize..8).prop_map(
            |(epochs, saveckp_freq, seed, world_size)| TrainingParams {
                epochs,
                saveckp_freq,
                seed,
                world_size,
                output_dir: PathBuf::from("./runs"),
                ..TrainingParams::default()
            },
        )
    }

    fn arb_train_spec() -> impl Strategy<Value = TrainSpec> {
        (arb_model(), arb_optim(), arb_masking(), arb_training(), 1usize..12).prop_map(
            |(model, optimizer, masking, training, local_crops)| TrainSpec {
                model,
                optimizer,
                masking,
                training,
                crops: CropSpec {
                    local_crops,
                    ..CropSpec::default()
                },
                ..TrainSpec::default()
            },
        )
    }

    // ============================================================
    // Properties
    // ============================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_yaml_round_trip(spec in arb_train_spec()) {
            let yaml = serde_yaml::to_string(&spec).unwrap();
            let back: TrainSpec = serde_yaml::from_str(&yaml).unwrap();
            prop_assert_eq!(back, spec);
        }

        #[test]
        fn prop_json_round_trip(spec in arb_train_spec()) {
            let json = serde_json::to_string(&spec).unwrap();
            let back: TrainSpec = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, spec);
        }

        #[test]
        fn prop_generated_specs_validate(spec in arb_train_spec()) {
            prop_assert_eq!(validate_config(&spec, &known()), Ok(()));
        }

        #[test]
        fn prop_ratio_at_or_above_one_rejected(mut spec in arb_train_spec(), ratio in 1.0f64..10.0) {
            spec.masking.ratio = ratio;
            prop_assert_eq!(
                validate_config(&spec, &known()),
                Err(ValidationError::InvalidMaskingRatio(ratio))
            );
        }

        #[test]
        fn prop_scaled_lr_is_linear_in_world_size(spec in arb_train_spec()) {
            let mut doubled = spec.clone();
            doubled.training.world_size *= 2;
            let ratio = doubled.scaled_lr() / spec.scaled_lr();
            prop_assert!((ratio - 2.0).abs() < 1e-9);
        }
    }
}
