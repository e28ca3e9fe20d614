//! Startup utilities for the APIM operator

mod crds;

pub use crds::{all_crds_yaml, ensure_crds_installed};
