pub mod crd;
pub mod error;
pub mod names;
pub mod prom;

pub use error::AppError;

/// Comma-separated list of canonical label selectors which match the
/// Rill controller's labelling scheme.
pub const RILL_CONTROLLER_LABEL_SELECTORS: &str = "app=rill,rill.rs/controlled-by=rill-controller";
