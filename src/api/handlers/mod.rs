//! API handlers for the federation service.

pub mod health;
pub mod oauth;
pub mod root;
