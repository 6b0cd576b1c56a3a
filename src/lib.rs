//! Local LLM completion server using WGPU - Library exports for testing
//!
//! (c) Softlandia 2025

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod infrastructure;
pub mod rpc;
