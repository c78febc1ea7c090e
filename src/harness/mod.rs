pub mod run;
pub mod types;

pub use run::run_harness;
pub use types::{HarnessConfig, HarnessReport};
