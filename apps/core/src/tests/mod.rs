//! Test Module
//!
//! Crate-level tests that exercise several modules together.
//!
//! ## Test Categories
//! - `keyword_tests`: tokenizer examples and TF-IDF ranking properties
//! - `manager_tests`: model selection, retries, result cache and overrides
//! - `integration_tests`: manager driving real adapters against mock HTTP servers
