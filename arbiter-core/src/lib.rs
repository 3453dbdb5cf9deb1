pub mod crd;
pub mod error;
pub mod resources;

pub use error::AppError;
pub use resources::ResourceVector;

/// The canonical app label value of objects controlled by the operator.
pub const LABEL_APP: &str = "arbiter";
/// The canonical label identifying the controller of an object.
pub const LABEL_CONTROLLED_BY: &str = "arbiter.rs/controlled-by";
/// The field manager & controller name of the operator.
pub const OPERATOR_NAME: &str = "arbiter-operator";

/// Comma-separated list of canonical label selectors which match the
/// Arbiter Operator's labelling scheme.
pub const ARBITER_OPERATOR_LABEL_SELECTORS: &str = "app=arbiter,arbiter.rs/controlled-by=arbiter-operator";
