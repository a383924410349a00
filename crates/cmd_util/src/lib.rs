//! Small self-contained helpers shared by command-line entry points:
//! environment-driven config and tracing setup.

pub mod env;
pub mod keyvalue;
