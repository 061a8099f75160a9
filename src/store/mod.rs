//! Result store module.
//!
//! Holds the target model and the latest outcome per target.

mod models;
mod results;

pub use models::*;
pub use results::*;
