//! Session and installation manager of a third-party game distribution client.
//!
//! [`context::ClientContext`] wires the session manager, the catalog, the
//! install pipeline and the launch manager, and exposes the commands used by
//! a view layer.

pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod installer;
pub mod launcher;
pub mod remote;
pub mod session;

pub use context::{ClientContext, Services};
