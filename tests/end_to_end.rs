//! Runs driven entirely by a TOML model configuration.

use approx::assert_relative_eq;
use rspool::prelude::*;
use std::sync::Arc;

const CONFIG: &str = r#"
decay_rates = [0.2, 0.015]
initial_mass = [5.0, 10.0]
initial_signature = [0.0, 0.0]
lag = 1.0

[topology]
kind = "series"
transfer = [0.15]

[input]
partition = [1.0, 0.0]
magnitude = 1.0

[time_grid]
start = 1940.0
end = 2020.0
step = 2.0

[ages]
end = 2000.0
points = 4001
quantiles = [0.25, 0.5, 0.75]

[isotope]
half_life = 5730.0
ratio_standard = 1.0

[isotope.source]
times = [1940.0, 1955.0, 1964.0, 1990.0, 2020.0]
values = [0.0, 0.0, 750.0, 150.0, 0.0]

[solver]
method = "implicit"
rtol = 1e-7
"#;

#[test]
fn test_simulation_from_configuration_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = ModelConfig::from_path(&path).unwrap();
    let model = config.build_model().unwrap();
    let times = config.time_grid().unwrap();
    let source = config.source_curve().unwrap();

    let trajectory = simulate_isotopes(
        &model,
        &source,
        &config.isotope_settings(),
        &times,
        &config.solver_options(),
        None,
    )
    .unwrap();
    let derived = signatures(&model, &trajectory).unwrap();
    assert!(derived.is_fully_defined());

    // Starts at steady state, so mass stays put
    let last = times.len() - 1;
    assert_relative_eq!(trajectory.mass[[last, 0]], 5.0, max_relative = 1e-6);
    assert_relative_eq!(trajectory.mass[[last, 1]], 10.0, max_relative = 1e-6);

    // Bomb signal reaches the fast pool before the slow one
    let peak = |pool: usize| {
        (0..times.len())
            .max_by(|a, b| {
                let sa = derived.pools[[*a, pool]].unwrap();
                let sb = derived.pools[[*b, pool]].unwrap();
                sa.total_cmp(&sb)
            })
            .map(|i| times[i])
            .unwrap()
    };
    assert!(peak(0) < peak(1));
    assert!(derived.pools[[0, 0]].unwrap() > -1.0);
    assert!(derived.warnings.is_empty());
}

#[test]
fn test_age_summaries_from_configuration() {
    let config = ModelConfig::from_toml_str(CONFIG).unwrap();
    let model = config.build_model().unwrap();
    let axis = config.age_axis().unwrap().unwrap();
    let system = LinearizedSystem::from_model(&model, 2000.0).unwrap();
    let dists = age_distributions(&system, &axis, None).unwrap();

    let summary = dists.system_summary(config.quantiles()).unwrap();
    assert!(summary.warnings.is_empty());
    let q: Vec<f64> = config
        .quantiles()
        .iter()
        .map(|p| summary.quantile(*p).unwrap())
        .collect();
    assert!(q[0] < q[1] && q[1] < q[2]);
    assert_relative_eq!(
        summary.mean.unwrap(),
        system.mean_system_age().unwrap(),
        max_relative = 1e-3
    );

    let source = config.source_curve().unwrap();
    let histogram = IsotopeDistributionEstimator::new(&system, &source, config.isotope_settings())
        .unwrap()
        .with_lag(model.lag())
        .histogram(&dists, 2000.0, AgeDensitySource::System, 25)
        .unwrap();
    assert_eq!(histogram.n_bins(), 25);
    let integral: f64 = histogram.density.iter().map(|d| d * histogram.bin_width()).sum();
    assert_relative_eq!(integral, 1.0, epsilon = 1e-9);
    // Bomb-era carbon lifts the stock above the pre-bomb background
    assert!(histogram.mean > 0.0);
}

#[test]
fn test_calibration_against_configured_model() {
    let config = ModelConfig::from_toml_str(CONFIG).unwrap();
    let source = Arc::new(config.source_curve().unwrap());

    let template = config.clone();
    let build = move |p: &[f64]| {
        let mut c = template.clone();
        c.decay_rates = vec![p[0], 0.015];
        c.initial_mass = vec![1.0 / p[0], 10.0];
        c.build_model()
    };
    let runner_for = |target: &Target| {
        PoolModelRunner::new(vec!["k_fast".to_string()], source.clone(), build.clone())
            .with_solver_options(config.solver_options())
            .with_start_time(1940.0)
            .for_target(target)
    };

    let mut probe = Target::new();
    for t in [1960.0, 1970.0, 1980.0, 1990.0] {
        probe.add_series(Observable::PoolSignature(0)).add(t, 0.0).unwrap();
    }
    let truth = runner_for(&probe).run(&[0.2]).unwrap();

    let mut target = Target::new();
    for t in [1960.0, 1970.0, 1980.0, 1990.0] {
        let value = truth.value_at(&Observable::PoolSignature(0), t).unwrap();
        target.add_series(Observable::PoolSignature(0)).add(t, value).unwrap();
    }
    let cost = CostFunction::new(runner_for(&target), target).unwrap();
    let mut params = ParameterSet::new();
    params.add("k_fast", 0.02, 2.0).unwrap();

    let fit = LevenbergMarquardt::new().fit(&cost, &params, &[0.5]).unwrap();
    assert!(fit.status.is_converged());
    assert_relative_eq!(fit.params[0], 0.2, max_relative = 1e-3);
}
