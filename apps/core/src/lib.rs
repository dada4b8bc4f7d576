//! PubMed Insight core.
//!
//! Two subsystems behind one crate:
//! - [`keywords`]: TF-IDF keyword extraction over mixed Chinese/English abstracts
//! - [`ai`]: provider-agnostic text generation and literature analysis

pub mod ai;
pub mod config;
pub mod error;
pub mod keywords;
pub mod models;

pub use ai::{AiServiceManager, ManagerSettings, ModelAdapter};
pub use config::ServiceSettings;
pub use error::AppError;
pub use keywords::{ExtractionOptions, KeywordEngine, KeywordResult};

#[cfg(test)]
mod tests;
