//! Router configuration
//!
//! The core accepts a structured [`RouterConfig`]; YAML files (with
//! `${VAR}` interpolation) and environment discovery are thin loaders on
//! top of it.

mod loader;
mod models;

pub use models::{
    CircuitBreakerConfig, ExhaustionConfig, ProviderConfig, RouterConfig, RoutingWeights,
    WeightProfile,
};
