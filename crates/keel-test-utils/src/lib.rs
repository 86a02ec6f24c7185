//! Test utilities for the Keel resource manager.
//!
//! This crate provides mock resource types, a scriptable loader and an event recorder
//! for exercising [`keel_resources::ResourceManager`] without real assets.
//!
//! # Overview
//!
//! - [`TestTexture`] - streams one mip level per update, has a placeholder
//! - [`TestMesh`] - single quality level, can be created from a descriptor
//! - [`TestShader`] - must be updated on the main thread
//! - [`MockLoader`] - in-memory loader that records calls and can be delayed or held
//! - [`EventLog`] - records resource events for later assertions
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keel_resources::prelude::*;
//! use keel_test_utils::{MockLoader, TestTexture};
//!
//! let loader = Arc::new(MockLoader::new());
//! loader.insert("brick.tex", TestTexture::encode(&[&[1, 2, 3, 4]]));
//!
//! let manager = ResourceManager::new(ResourceManagerConfig::default()).unwrap();
//! manager.set_default_loader(loader.clone());
//!
//! let brick: Handle<TestTexture> = manager.acquire_handle("brick.tex", AcquireMode::Load).unwrap();
//! let texture = manager.begin_access(&brick, FallbackPolicy::BlockTillLoaded).unwrap();
//! assert_eq!(texture.mip_count(), 1);
//! assert_eq!(loader.open_count(), 1);
//! ```

pub mod event_log;
pub mod mock_loader;
pub mod mock_resources;

pub use event_log::EventLog;
pub use mock_loader::{LoaderCall, MockLoader};
pub use mock_resources::{MeshDescriptor, TestMesh, TestShader, TestTexture};

/// Install a test-friendly tracing subscriber. Safe to call from every test.
pub fn init_test_logging() {
    keel_core::logging::init_with_filter("warn,keel_resources=debug");
}
