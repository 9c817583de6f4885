//! Compartmental pool models with isotope tracers.
//!
//! `rspool` bundles the two workspace crates:
//!
//! * [`rspool_core`]: the matrix model builder, the ODE integrators,
//!   the isotope decay coupler, derived signatures, age and transit-time
//!   distributions, isotope histograms and the TOML configuration surface.
//! * [`rspool_calibrate`]: least-squares fitting and Metropolis
//!   sampling of model parameters against observations.
//!
//! ```
//! use rspool::prelude::*;
//!
//! let model = PoolModelBuilder::new(vec![0.2, 0.015])
//!     .with_topology(Topology::Series { transfer: vec![0.15] })
//!     .with_input(InputFlux::into_pool(1.0, 0, 2)?)
//!     .build()?;
//! let steady = model.steady_state(0.0)?;
//! assert!((steady[1] - 10.0).abs() < 1e-9);
//! # Ok::<(), PoolError>(())
//! ```

pub use rspool_calibrate;
pub use rspool_core;

pub mod prelude {
    pub use rspool_calibrate::{
        BoundsPolicy, CostFunction, FitResult, FitStatus, LevenbergMarquardt, MetropolisSampler,
        ModelRunner, Objective, Observable, ParameterSet, PoolModelRunner, ProposalCovariance,
        SamplerSettings, Target,
    };
    pub use rspool_core::age::{age_distributions, AgeAxis, LinearizedSystem};
    pub use rspool_core::cancel::CancellationToken;
    pub use rspool_core::config::ModelConfig;
    pub use rspool_core::derived::{release_fluxes, signatures};
    pub use rspool_core::diagnostics::Degeneracy;
    pub use rspool_core::errors::{PoolError, PoolResult};
    pub use rspool_core::isotope::{simulate_isotopes, IsotopeSettings};
    pub use rspool_core::isotope_distribution::{AgeDensitySource, IsotopeDistributionEstimator};
    pub use rspool_core::ivp::{simulate, SolverMethod, SolverOptions};
    pub use rspool_core::model::{InputFlux, PoolModel, PoolModelBuilder, Topology};
    pub use rspool_core::source_curve::SourceCurve;
    pub use rspool_core::timeseries::{Extrapolation, Interpolation, Timeseries};
}
