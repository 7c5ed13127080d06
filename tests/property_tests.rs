//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use inference_gateway::config::{GatewayConfig, ModelConfig};
use inference_gateway::supervisor::backoff_delay;
use inference_gateway::{GatewayError, Registry};
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

// =============================================================================
// Arbitrary Implementations
// =============================================================================

/// Generate arbitrary ModelConfig values
fn arb_model_config() -> impl Strategy<Value = ModelConfig> {
    (
        "[a-zA-Z][a-zA-Z0-9_.-]{0,30}", // valid model name
        "/[a-z0-9/_-]{1,40}\\.mar",     // artifact path
        1usize..8,                      // instance_count
        prop::option::of(1usize..1000), // queue_depth
        1usize..16,                     // slots_per_instance
        prop::collection::vec("--[a-z-]{1,12}", 0..3),
    )
        .prop_map(
            |(name, artifact, instance_count, queue_depth, slots_per_instance, extra_args)| {
                ModelConfig {
                    name,
                    artifact,
                    instance_count,
                    queue_depth,
                    slots_per_instance,
                    extra_args,
                }
            },
        )
}

/// Generate configs covering the listener, timing and queue knobs
fn arb_gateway_config() -> impl Strategy<Value = GatewayConfig> {
    (
        1024u16..30000,  // management_port
        30000u16..40000, // inference_port
        10u64..5000,     // heartbeat_interval_ms
        1usize..10_000,  // default_queue_depth
        1u64..600_000,   // request_timeout_ms
        prop::collection::vec(arb_model_config(), 0..4),
    )
        .prop_map(
            |(
                management_port,
                inference_port,
                heartbeat_interval_ms,
                default_queue_depth,
                request_timeout_ms,
                models,
            )| GatewayConfig {
                management_port,
                inference_port,
                heartbeat_interval_ms,
                default_queue_depth,
                request_timeout_ms,
                models,
                ..Default::default()
            },
        )
}

/// Register/unregister operations against a small name pool
#[derive(Debug, Clone)]
enum RegistryOp {
    Register(usize),
    Unregister(usize),
}

fn arb_registry_ops() -> impl Strategy<Value = Vec<RegistryOp>> {
    prop::collection::vec(
        prop_oneof![
            (0usize..5).prop_map(RegistryOp::Register),
            (0usize..5).prop_map(RegistryOp::Unregister),
        ],
        1..60,
    )
}

// =============================================================================
// Config Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// ModelConfig survives a TOML round-trip unchanged
    #[test]
    fn model_config_toml_roundtrip(config in arb_model_config()) {
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: ModelConfig = toml::from_str(&toml_str).expect("deserialize");
        prop_assert_eq!(parsed, config);
    }

    /// GatewayConfig keeps its fields across a TOML round-trip
    #[test]
    fn gateway_config_toml_roundtrip(config in arb_gateway_config()) {
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: GatewayConfig = toml::from_str(&toml_str).expect("deserialize");

        prop_assert_eq!(parsed.management_port, config.management_port);
        prop_assert_eq!(parsed.inference_port, config.inference_port);
        prop_assert_eq!(parsed.heartbeat_interval_ms, config.heartbeat_interval_ms);
        prop_assert_eq!(parsed.default_queue_depth, config.default_queue_depth);
        prop_assert_eq!(parsed.request_timeout_ms, config.request_timeout_ms);
        prop_assert_eq!(parsed.models, config.models);
    }

    /// Valid model names never contain path separators
    #[test]
    fn model_name_validation(name in "\\PC{0,40}") {
        let valid = inference_gateway::config::validate_model_name(&name).is_ok();
        if valid {
            prop_assert!(!name.is_empty());
            prop_assert!(!name.contains('/'));
            prop_assert!(!name.contains('\\'));
        }
    }
}

// =============================================================================
// Restart Backoff Properties
// =============================================================================

proptest! {
    /// Delay never decreases with more attempts and never exceeds the cap
    #[test]
    fn backoff_monotone_and_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        attempts in 0u32..64,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(max_ms);

        let current = backoff_delay(base, max, attempts);
        let next = backoff_delay(base, max, attempts + 1);

        prop_assert!(current <= max);
        prop_assert!(next >= current);
        prop_assert_eq!(backoff_delay(base, max, 0), base.min(max));
    }
}

// =============================================================================
// Registry Properties
// =============================================================================

proptest! {
    /// The registry mirrors a set: names are unique and duplicates are refused
    #[test]
    fn registry_names_unique(ops in arb_registry_ops()) {
        let registry = Registry::new(None, 10);
        let mut expected: HashSet<String> = HashSet::new();

        for op in ops {
            match op {
                RegistryOp::Register(i) => {
                    let name = format!("model-{}", i);
                    let result = registry.register(ModelConfig {
                        name: name.clone(),
                        artifact: format!("/models/{}.mar", name),
                        ..Default::default()
                    });
                    if expected.insert(name) {
                        prop_assert!(result.is_ok());
                    } else {
                        let is_duplicate = matches!(result, Err(GatewayError::DuplicateModel { .. }));
                        prop_assert!(is_duplicate);
                    }
                }
                RegistryOp::Unregister(i) => {
                    let name = format!("model-{}", i);
                    let result = registry.unregister(&name);
                    prop_assert_eq!(result.is_ok(), expected.remove(&name));
                }
            }

            prop_assert_eq!(registry.count(), expected.len());
        }

        let listed: Vec<String> = registry.list().into_iter().map(|e| e.name).collect();
        let mut sorted: Vec<String> = expected.into_iter().collect();
        sorted.sort();
        prop_assert_eq!(listed, sorted);
    }
}
