//! Integration tests: prediction, simulation and persistence of fitted models.

mod common;

use approx::assert_relative_eq;
use binary_glmm_core::glmm::{from_json_str, to_json_string, FittedModel};
use binary_glmm_core::predict::{PredictionScale, SimulationScale};
use binary_glmm_core::{
    predict, simulate, CancellationToken, GlmmBuilder, GlmmError, GroupingSpec, PredictOptions,
    SimulateOptions, UnseenLevelPolicy,
};

fn fitted() -> FittedModel {
    let df = common::hospital_data(21);
    GlmmBuilder::new()
        .data(&df)
        .response("y")
        .fixed("age")
        .group(GroupingSpec::new("hospital"))
        .group(GroupingSpec::new("ward").within("hospital"))
        .build()
        .unwrap()
        .fit()
        .unwrap()
}

#[test]
fn test_prediction_is_deterministic_and_uses_modes() {
    let model = fitted();
    let df = common::request(&[("H1", "W2", 0.3), ("H4", "W1", -1.0)]);
    let link = PredictOptions {
        scale: PredictionScale::Link,
        ..PredictOptions::default()
    };

    let first = predict(&model, &df, &link).unwrap();
    let second = predict(&model, &df, &link).unwrap();
    assert_eq!(first.values, second.values);

    let expected = model.coefficient("(Intercept)").unwrap()
        + 0.3 * model.coefficient("age").unwrap()
        + model.random_effect("hospital", "H1").unwrap()
        + model.random_effect("ward", "H1/W2").unwrap();
    assert_relative_eq!(first.values[0], expected, epsilon = 1e-12);

    let response = predict(&model, &df, &PredictOptions::default()).unwrap();
    for (eta, p) in first.values.iter().zip(&response.values) {
        assert_relative_eq!(*p, 1.0 / (1.0 + (-eta).exp()), epsilon = 1e-12);
    }
}

#[test]
fn test_unseen_levels() {
    let model = fitted();
    // A new ward in a known hospital, and a new hospital altogether.
    let df = common::request(&[("H2", "W9", 0.5), ("H99", "W1", 0.5)]);

    let zero = predict(&model, &df, &PredictOptions::default()).unwrap();
    assert_eq!(zero.unseen[0].rows, 1);
    assert_eq!(zero.unseen[1].rows, 2);
    assert_eq!(zero.unseen_rows(), 3);

    let typical = PredictOptions {
        use_fitted_random_effects: false,
        ..PredictOptions::default()
    };
    let population = predict(&model, &df, &typical).unwrap();
    // New hospital: every random contribution is zero.
    assert_eq!(zero.values[1], population.values[1]);
    // New ward in a known hospital keeps the hospital mode only.
    let eta = model.coefficient("(Intercept)").unwrap()
        + 0.5 * model.coefficient("age").unwrap()
        + model.random_effect("hospital", "H2").unwrap();
    assert_relative_eq!(zero.values[0], 1.0 / (1.0 + (-eta).exp()), epsilon = 1e-12);

    let reject = PredictOptions {
        unseen_level_policy: Some(UnseenLevelPolicy::Reject),
        ..PredictOptions::default()
    };
    match predict(&model, &df, &reject) {
        Err(GlmmError::UnseenLevel { factor, level }) => {
            assert_eq!(factor, "hospital");
            assert_eq!(level, "H99");
        }
        other => panic!("expected UnseenLevel, got {:?}", other),
    }
}

#[test]
fn test_simulation_mean_converges_to_prediction() {
    let model = fitted();
    let df = common::request(&[("H3", "W3", 0.0), ("H5", "W1", 1.2)]);
    let options = SimulateOptions {
        n_draws: 4000,
        use_fitted_random_effects: true,
        seed: 2024,
        ..SimulateOptions::default()
    };
    let sim = simulate(&model, &df, &options, &CancellationToken::new()).unwrap();
    let p = predict(&model, &df, &PredictOptions::default()).unwrap();

    assert_eq!(sim.draws.shape(), (4000, 2));
    for i in 0..2 {
        assert!((sim.means[i] - p.values[i]).abs() < 0.05);
    }

    let again = simulate(&model, &df, &options, &CancellationToken::new()).unwrap();
    assert_eq!(sim.draws, again.draws);
}

#[test]
fn test_population_simulation_varies_between_draws() {
    let model = fitted();
    let df = common::request(&[("H1", "W1", 0.0), ("H1", "W1", 0.0)]);
    let options = SimulateOptions {
        n_draws: 200,
        scale: SimulationScale::Probability,
        ..SimulateOptions::default()
    };
    let sim = simulate(&model, &df, &options, &CancellationToken::new()).unwrap();
    for d in 0..200 {
        // Rows of the same level share the level's draw.
        assert_eq!(sim.draws[(d, 0)], sim.draws[(d, 1)]);
        assert!(sim.draws[(d, 0)] > 0.0 && sim.draws[(d, 0)] < 1.0);
    }
}

#[test]
fn test_json_roundtrip_reproduces_predictions() {
    let model = fitted();
    let json = to_json_string(&model).unwrap();
    let restored = from_json_str(&json).unwrap();

    for (a, b) in model.fixed_effects.iter().zip(&restored.fixed_effects) {
        assert_eq!(a.estimate.to_bits(), b.estimate.to_bits());
    }
    assert_eq!(model.variances(), restored.variances());
    assert_eq!(model.factors, restored.factors);

    let df = common::request(&[("H1", "W1", 0.1), ("H6", "W4", -0.4), ("H2", "W3", 2.0)]);
    let before = predict(&model, &df, &PredictOptions::default()).unwrap();
    let after = predict(&restored, &df, &PredictOptions::default()).unwrap();
    assert_eq!(before.values, after.values);
}
