pub mod age;
pub mod cancel;
pub mod config;
pub mod constants;
pub mod derived;
pub mod diagnostics;
pub mod isotope;
pub mod isotope_distribution;
pub mod ivp;
pub mod model;
pub mod source_curve;
pub mod timeseries;
pub mod utils;

pub mod errors;
