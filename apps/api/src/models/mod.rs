//! Rows owned by collaborators outside the billing and task core. This crate
//! reads them and, for workflows, bumps the usage counter.

pub mod resume;
pub mod site_variable;
pub mod workflow;
