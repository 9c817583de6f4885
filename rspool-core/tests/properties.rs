//! Model-level properties checked against analytic solutions.
//!
//! These tests exercise the builder, integrators, isotope coupler, derived
//! signatures and age engine together:
//! - analytic steady states and transient solutions
//! - respired signature bounded by the pool signatures
//! - age densities integrating to one
//! - consistency between the cohort histogram and the isotope mass balance

use approx::assert_relative_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rspool_core::age::{age_distributions, AgeAxis, LinearizedSystem};
use rspool_core::derived::{signature, signatures};
use rspool_core::isotope::{simulate_isotopes, steady_state_isotope_mass, IsotopeSettings};
use rspool_core::isotope_distribution::{AgeDensitySource, IsotopeDistributionEstimator};
use rspool_core::ivp::{simulate, SolverMethod, SolverOptions};
use rspool_core::model::{InputFlux, PoolModel, PoolModelBuilder, Topology};
use rspool_core::source_curve::SourceCurve;
use rspool_core::utils::quadrature::trapezoid;

fn series_model(k: &[f64], transfer: &[f64], input: f64) -> PoolModel {
    PoolModelBuilder::new(k.to_vec())
        .with_topology(Topology::Series {
            transfer: transfer.to_vec(),
        })
        .with_input(InputFlux::into_pool(input, 0, k.len()).unwrap())
        .build()
        .unwrap()
}

mod mass_balance {
    use super::*;

    #[test]
    fn test_one_pool_approaches_input_over_k() {
        let model = series_model(&[0.1], &[], 1.0);
        for method in [SolverMethod::Implicit, SolverMethod::Dopri5] {
            let options = SolverOptions {
                method,
                ..SolverOptions::default()
            };
            let trajectory = simulate(&model, &[0.0, 10.0, 500.0], &options, None).unwrap();
            // 10 * (1 - e^-1)
            assert_relative_eq!(trajectory.states[[1, 0]], 6.3212, max_relative = 0.01);
            assert_relative_eq!(trajectory.states[[2, 0]], 10.0, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_one_pool_steady_state_is_analytic() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..20 {
            let k = rng.gen_range(0.001..5.0);
            let input = rng.gen_range(0.1..100.0);
            let model = series_model(&[k], &[], input);
            assert_relative_eq!(
                model.steady_state(0.0).unwrap()[0],
                input / k,
                max_relative = 1e-10
            );
        }
    }

    #[test]
    fn test_two_pool_series_steady_state() {
        let model = series_model(&[0.2, 0.015], &[0.15], 1.0);
        let steady = model.steady_state(0.0).unwrap();
        assert_relative_eq!(steady[0], 5.0, max_relative = 1e-10);
        assert_relative_eq!(steady[1], 10.0, max_relative = 1e-10);

        let trajectory =
            simulate(&model, &[0.0, 2000.0], &SolverOptions::default(), None).unwrap();
        assert_relative_eq!(trajectory.states[[1, 0]], 5.0, max_relative = 1e-4);
        assert_relative_eq!(trajectory.states[[1, 1]], 10.0, max_relative = 1e-4);
    }

    #[test]
    fn test_zero_transfer_series_is_two_independent_decays() {
        let (k1, k2) = (0.3, 0.02);
        let model = PoolModelBuilder::new(vec![k1, k2])
            .with_topology(Topology::Series {
                transfer: vec![0.0],
            })
            .with_initial_mass(vec![3.0, 7.0])
            .build()
            .unwrap();
        let times: Vec<f64> = (0..=20).map(|i| i as f64 * 5.0).collect();
        let options = SolverOptions {
            rtol: 1e-9,
            atol: 1e-12,
            ..SolverOptions::default()
        };
        let trajectory = simulate(&model, &times, &options, None).unwrap();
        for (i, t) in times.iter().enumerate() {
            assert_relative_eq!(
                trajectory.states[[i, 0]],
                3.0 * (-k1 * t).exp(),
                max_relative = 1e-6,
                epsilon = 1e-10
            );
            assert_relative_eq!(
                trajectory.states[[i, 1]],
                7.0 * (-k2 * t).exp(),
                max_relative = 1e-6
            );
        }
    }

    #[test]
    fn test_methods_agree_on_stiff_model() {
        let model = series_model(&[5.0, 0.001], &[0.5], 1.0);
        let times = [0.0, 1.0, 10.0, 100.0];
        let implicit = simulate(&model, &times, &SolverOptions::default(), None).unwrap();
        let explicit = simulate(
            &model,
            &times,
            &SolverOptions {
                method: SolverMethod::Dopri5,
                ..SolverOptions::default()
            },
            None,
        )
        .unwrap();
        for i in 0..times.len() {
            for j in 0..2 {
                assert_relative_eq!(
                    implicit.states[[i, j]],
                    explicit.states[[i, j]],
                    max_relative = 1e-3,
                    epsilon = 1e-6
                );
            }
        }
    }
}

mod signatures_mixing {
    use super::*;

    fn random_model(rng: &mut ChaCha8Rng, n: usize) -> PoolModel {
        let k: Vec<f64> = (0..n).map(|_| rng.gen_range(0.01..1.0)).collect();
        let transfer: Vec<f64> = (0..n - 1).map(|_| rng.gen_range(0.0..0.9)).collect();
        let raw: Vec<f64> = (0..n).map(|_| rng.gen_range(0.1..1.0)).collect();
        let total: f64 = raw.iter().sum();
        let partition = raw.iter().map(|r| r / total).collect();
        PoolModelBuilder::new(k)
            .with_topology(Topology::Series { transfer })
            .with_input(InputFlux::constant(rng.gen_range(0.5..5.0), partition).unwrap())
            .with_initial_mass((0..n).map(|_| rng.gen_range(1.0..20.0)).collect())
            .with_initial_signature((0..n).map(|_| rng.gen_range(-100.0..500.0)).collect())
            .build()
            .unwrap()
    }

    #[test]
    fn test_respired_signature_between_pool_signatures() {
        let mut rng = ChaCha8Rng::seed_from_u64(2024);
        let source = SourceCurve::from_pairs(&[
            (1950.0, 0.0),
            (1963.0, 800.0),
            (1980.0, 300.0),
            (2020.0, 0.0),
        ])
        .unwrap();
        let times: Vec<f64> = (0..=35).map(|i| 1945.0 + 2.0 * i as f64).collect();

        for case in 0..30 {
            let n = 2 + case % 2;
            let model = random_model(&mut rng, n);
            let trajectory = simulate_isotopes(
                &model,
                &source,
                &IsotopeSettings::default(),
                &times,
                &SolverOptions::default(),
                None,
            )
            .unwrap();
            let result = signatures(&model, &trajectory).unwrap();
            assert!(result.is_fully_defined());

            for i in 0..times.len() {
                let pools: Vec<f64> = (0..n).map(|j| result.pools[[i, j]].unwrap()).collect();
                let lo = pools.iter().cloned().fold(f64::INFINITY, f64::min);
                let hi = pools.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let respired = result.respired[i].unwrap();
                let system = result.system[i].unwrap();
                assert!(
                    respired >= lo - 1e-9 && respired <= hi + 1e-9,
                    "case {} t={}: respired {} outside [{}, {}]",
                    case,
                    times[i],
                    respired,
                    lo,
                    hi
                );
                assert!(system >= lo - 1e-9 && system <= hi + 1e-9);
            }
        }
    }
}

mod ages {
    use super::*;

    #[test]
    fn test_age_densities_integrate_to_one() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let axis = AgeAxis::linspace(0.0, 400.0, 4001).unwrap();
        for _ in 0..10 {
            let k: Vec<f64> = (0..3).map(|_| rng.gen_range(0.05..1.0)).collect();
            let transfer: Vec<f64> = (0..2).map(|_| rng.gen_range(0.0..0.9)).collect();
            let model = series_model(&k, &transfer, 1.0);
            let system = LinearizedSystem::from_model(&model, 0.0).unwrap();
            let dists = age_distributions(&system, &axis, None).unwrap();

            assert_relative_eq!(trapezoid(&dists.ages, &dists.system.to_vec()), 1.0, epsilon = 5e-3);
            assert_relative_eq!(trapezoid(&dists.ages, &dists.transit.to_vec()), 1.0, epsilon = 5e-3);
            for j in 0..3 {
                let pool = dists.pools.column(j).to_vec();
                assert_relative_eq!(trapezoid(&dists.ages, &pool), 1.0, epsilon = 5e-3);
            }
            assert!(dists.warnings.is_empty());
        }
    }

    #[test]
    fn test_numerical_means_match_closed_form() {
        let model = series_model(&[0.2, 0.015], &[0.15], 1.0);
        let system = LinearizedSystem::from_model(&model, 0.0).unwrap();
        let axis = AgeAxis::linspace(0.0, 2000.0, 8001).unwrap();
        let dists = age_distributions(&system, &axis, None).unwrap();

        let age = dists.system_summary(&[0.5]).unwrap();
        assert_relative_eq!(age.mean.unwrap(), system.mean_system_age().unwrap(), max_relative = 1e-3);
        let transit = dists.transit_summary(&[0.5]).unwrap();
        assert_relative_eq!(transit.mean.unwrap(), system.mean_transit_time(), max_relative = 1e-3);
        assert!(transit.median().unwrap() < transit.mean.unwrap());
    }

    #[test]
    fn test_transit_time_rises_as_slow_pool_slows() {
        let axis = AgeAxis::linspace(0.0, 5000.0, 10001).unwrap();
        let mut previous = 0.0;
        for k2 in [0.2, 0.1, 0.05, 0.02, 0.01] {
            let model = series_model(&[0.5, k2], &[0.3], 1.0);
            let system = LinearizedSystem::from_model(&model, 0.0).unwrap();
            let closed = system.mean_transit_time();
            let numerical = age_distributions(&system, &axis, None)
                .unwrap()
                .transit_summary(&[])
                .unwrap()
                .mean
                .unwrap();
            assert!(closed > previous, "k2={}: {} <= {}", k2, closed, previous);
            assert_relative_eq!(numerical, closed, max_relative = 5e-3);
            previous = closed;
        }
    }
}

mod isotope_histogram {
    use super::*;

    #[test]
    fn test_histogram_mean_matches_steady_state_signature() {
        let model = series_model(&[0.2, 0.015], &[0.15], 1.0);
        let source = SourceCurve::constant(50.0).unwrap();
        let settings = IsotopeSettings::default();
        let system = LinearizedSystem::from_model(&model, 0.0).unwrap();
        let axis = AgeAxis::linspace(0.0, 3000.0, 6001).unwrap();
        let dists = age_distributions(&system, &axis, None).unwrap();

        let iso = steady_state_isotope_mass(&model, &source, &settings, 0.0).unwrap();
        let mass = system.steady_state();
        let direct = signature(mass.sum(), iso.sum(), settings.ratio_standard, None, 0.0).unwrap();

        let estimator = IsotopeDistributionEstimator::new(&system, &source, settings.clone())
            .unwrap();
        let hist = estimator
            .histogram(&dists, 2000.0, AgeDensitySource::System, 40)
            .unwrap();
        assert_relative_eq!(hist.mean, direct, epsilon = 0.1);
        assert!((hist.binned_mean - direct).abs() < hist.bin_width());
        assert_relative_eq!(hist.total_mass, mass.sum(), max_relative = 1e-3);

        let slow = estimator
            .histogram(&dists, 2000.0, AgeDensitySource::Pool(1), 40)
            .unwrap();
        let slow_direct =
            signature(mass[1], iso[1], settings.ratio_standard, Some(1), 0.0).unwrap();
        assert_relative_eq!(slow.mean, slow_direct, epsilon = 0.1);
    }
}
