//! Ferrous Upstream Infrastructure Layer
pub mod dns;
