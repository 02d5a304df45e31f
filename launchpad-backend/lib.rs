//! Launchpad: turns a prompt into a runnable web project and serves a live
//! preview of it from a managed execution environment.

pub mod api;
pub mod config;
pub mod files;
pub mod generation;
pub mod manager;
pub mod providers;
pub mod sandbox;
pub mod status;
