//! Billing: action price catalog, package templates and the per-user credit ledger.

pub mod catalog;
pub mod handlers;
pub mod ledger;
pub mod models;
