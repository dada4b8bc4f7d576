//! # Keywords Module
//!
//! Corpus-level keyword extraction for PubMed result sets.
//!
//! ## Components
//! - `stopwords`: seeded English and Chinese stopword lists
//! - `tokenizer`: mixed-script tokenization and filtering
//! - `extractor`: TF-IDF scoring engine with result cache

pub mod extractor;
pub mod stopwords;
pub mod tokenizer;

pub use extractor::{CorpusStats, ExtractionOptions, KeywordEngine, KeywordResult};
