//! LinUCB contextual bandit over learning actions.
//!
//! [`LinUcbModel`] owns one learner's ridge-regression state and is the
//! reference implementation the dispatcher falls back to.

pub mod coldstart;
pub mod features;
pub mod model;

pub use coldstart::cold_start_alpha;
pub use features::{build_feature_vector, canonical_features};
pub use model::LinUcbModel;
