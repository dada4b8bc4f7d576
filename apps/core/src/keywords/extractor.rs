//! Keyword Extraction using TF-IDF.
//!
//! Ranks terms across a whole result set rather than inside a single text:
//! every submitted document is one unit of the corpus, IDF is computed over
//! that corpus, and each term's score is the mean of its per-document TF-IDF.
//! Includes stopword filtering for Chinese and English.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};
use validator::Validate;

use super::stopwords::{STOPWORDS_EN, STOPWORDS_ZH};
use super::tokenizer::tokenize;
use crate::error::AppError;
use crate::models::LiteratureItem;

/// Default number of cached extraction results
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// One scored term of the corpus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeywordResult {
    /// The normalized token
    pub word: String,
    /// Summed per-document TF-IDF divided by the corpus size
    pub tf: f64,
    /// Fraction of documents containing the term
    pub df: f64,
    /// `ln(N / (df_abs + 1))`, negative for terms present in every document
    pub idf: f64,
    /// Mean TF-IDF over the documents containing the term
    pub tfidf: f64,
    /// Raw occurrence count across the corpus
    pub frequency: usize,
    /// Number of documents containing the term
    pub document_count: usize,
}

/// Options of one extraction call
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionOptions {
    pub min_word_length: usize,
    /// Drops terms occurring more often than this; values below 1 disable the cap
    pub max_word_frequency: Option<f64>,
    #[validate(range(min = 0.0))]
    pub max_document_frequency: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_percentage: f64,
    /// Informational only; the tokenizer handles mixed scripts regardless
    pub language: Option<String>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            min_word_length: 3,
            max_word_frequency: None,
            max_document_frequency: 0.8,
            top_percentage: 0.35,
            language: None,
        }
    }
}

/// Corpus-level figures reported next to the ranked keywords
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorpusStats {
    pub document_count: usize,
    pub vocabulary_size: usize,
    pub average_tokens_per_document: f64,
}

#[derive(Default)]
struct TermStats {
    frequency: usize,
    document_count: usize,
    tfidf_sum: f64,
}

/// TF-IDF keyword engine.
///
/// Owns the stopword set and a FIFO result cache. Construct one per
/// application and share it by reference; tests build isolated instances.
pub struct KeywordEngine {
    stopwords: RwLock<HashSet<String>>,
    cache: Mutex<IndexMap<String, Vec<KeywordResult>>>,
    cache_capacity: usize,
}

impl Default for KeywordEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordEngine {
    /// Create an engine with the seeded stopwords and the default cache size
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_CACHE_CAPACITY)
    }

    /// Create an engine holding at most `cache_capacity` cached results
    pub fn with_cache_capacity(cache_capacity: usize) -> Self {
        let stopwords: HashSet<String> = STOPWORDS_EN
            .iter()
            .chain(STOPWORDS_ZH.iter())
            .map(|s| s.to_lowercase())
            .collect();

        Self {
            stopwords: RwLock::new(stopwords),
            cache: Mutex::new(IndexMap::new()),
            cache_capacity: cache_capacity.max(1),
        }
    }

    /// Extract ranked keywords from a document collection.
    ///
    /// An empty collection, or one whose documents contain nothing but
    /// stopwords, yields an empty list. Identical `(documents, options)`
    /// input is answered from the cache.
    pub fn extract_keywords<S: AsRef<str>>(
        &self,
        documents: &[S],
        options: &ExtractionOptions,
    ) -> Result<Vec<KeywordResult>, AppError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        options.validate()?;

        let key = cache_key(documents, options)?;
        if let Some(cached) = self.lock_cache().get(&key) {
            debug!("Keyword cache hit for {} documents", documents.len());
            return Ok(cached.clone());
        }

        let keywords = self.score(documents, options);
        info!(
            "Extracted {} keywords from {} documents",
            keywords.len(),
            documents.len()
        );

        let mut cache = self.lock_cache();
        if cache.len() >= self.cache_capacity {
            cache.shift_remove_index(0);
        }
        cache.insert(key, keywords.clone());

        Ok(keywords)
    }

    /// Extract keywords from PubMed records (title + abstract + keywords)
    pub fn extract_from_items(
        &self,
        items: &[LiteratureItem],
        options: &ExtractionOptions,
    ) -> Result<Vec<KeywordResult>, AppError> {
        let documents: Vec<String> = items.iter().map(LiteratureItem::to_document).collect();
        self.extract_keywords(&documents, options)
    }

    /// Document count, vocabulary size and mean token count after filtering
    pub fn corpus_stats<S: AsRef<str>>(&self, documents: &[S], options: &ExtractionOptions) -> CorpusStats {
        let tokenized = self.tokenize_all(documents, options.min_word_length);
        let vocabulary: HashSet<&str> = tokenized.iter().flatten().map(String::as_str).collect();
        let total_tokens: usize = tokenized.iter().map(Vec::len).sum();

        CorpusStats {
            document_count: documents.len(),
            vocabulary_size: vocabulary.len(),
            average_tokens_per_document: if documents.is_empty() {
                0.0
            } else {
                total_tokens as f64 / documents.len() as f64
            },
        }
    }

    fn score<S: AsRef<str>>(&self, documents: &[S], options: &ExtractionOptions) -> Vec<KeywordResult> {
        let tokenized = self.tokenize_all(documents, options.min_word_length);
        let total_documents = documents.len() as f64;

        // Per-document counts, vocabulary in first-appearance order
        let mut vocabulary: IndexMap<&str, TermStats> = IndexMap::new();
        let mut doc_counts: Vec<IndexMap<&str, usize>> = Vec::with_capacity(tokenized.len());
        for tokens in &tokenized {
            let mut counts: IndexMap<&str, usize> = IndexMap::new();
            for token in tokens {
                *counts.entry(token.as_str()).or_insert(0) += 1;
            }
            for (term, &count) in &counts {
                let stats = vocabulary.entry(*term).or_default();
                stats.frequency += count;
                stats.document_count += 1;
            }
            doc_counts.push(counts);
        }

        if vocabulary.is_empty() {
            return Vec::new();
        }

        for (tokens, counts) in tokenized.iter().zip(&doc_counts) {
            let doc_len = tokens.len() as f64;
            for (term, &count) in counts {
                if let Some(stats) = vocabulary.get_mut(term) {
                    let idf = idf(total_documents, stats.document_count);
                    stats.tfidf_sum += (count as f64 / doc_len) * idf;
                }
            }
        }

        let max_word_frequency = options.max_word_frequency.filter(|cap| *cap >= 1.0);
        let mut keywords: Vec<KeywordResult> = vocabulary
            .into_iter()
            .map(|(word, stats)| KeywordResult {
                word: word.to_string(),
                tf: stats.tfidf_sum / total_documents,
                df: stats.document_count as f64 / total_documents,
                idf: idf(total_documents, stats.document_count),
                tfidf: stats.tfidf_sum / stats.document_count as f64,
                frequency: stats.frequency,
                document_count: stats.document_count,
            })
            .filter(|k| match max_word_frequency {
                Some(cap) => k.frequency as f64 <= cap,
                None => true,
            })
            .filter(|k| k.df <= options.max_document_frequency)
            .collect();

        if keywords.is_empty() {
            return keywords;
        }

        // Stable sort keeps first-appearance order for ties
        keywords.sort_by(|a, b| {
            b.tfidf
                .partial_cmp(&a.tfidf)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let keep = ((keywords.len() as f64 * options.top_percentage).floor() as usize).max(1);
        keywords.truncate(keep);
        keywords
    }

    fn tokenize_all<S: AsRef<str>>(&self, documents: &[S], min_word_length: usize) -> Vec<Vec<String>> {
        let stopwords = self.stopwords.read().unwrap_or_else(PoisonError::into_inner);
        documents
            .iter()
            .map(|doc| tokenize(doc.as_ref(), &stopwords, min_word_length))
            .collect()
    }

    fn lock_cache(&self) -> MutexGuard<'_, IndexMap<String, Vec<KeywordResult>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Administration ---

    /// Add stopwords (case-folded). Returns how many were new.
    ///
    /// Cached results are dropped when the set changes, since they were
    /// computed against the previous stopwords.
    pub fn add_stopwords<I, S>(&self, words: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let added = {
            let mut stopwords = self.stopwords.write().unwrap_or_else(PoisonError::into_inner);
            words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .filter(|w| stopwords.insert(w.clone()))
                .count()
        };
        if added > 0 {
            self.clear_cache();
        }
        added
    }

    /// Remove stopwords. Words not in the set are ignored. Returns how many were removed.
    pub fn remove_stopwords<I, S>(&self, words: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = {
            let mut stopwords = self.stopwords.write().unwrap_or_else(PoisonError::into_inner);
            words
                .into_iter()
                .filter(|w| stopwords.remove(&w.as_ref().trim().to_lowercase()))
                .count()
        };
        if removed > 0 {
            self.clear_cache();
        }
        removed
    }

    /// Current stopwords, sorted
    pub fn stopwords(&self) -> Vec<String> {
        let stopwords = self.stopwords.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<String> = stopwords.iter().cloned().collect();
        list.sort();
        list
    }

    pub fn is_stopword(&self, word: &str) -> bool {
        self.stopwords
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&word.to_lowercase())
    }

    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    pub fn cache_size(&self) -> usize {
        self.lock_cache().len()
    }
}

/// `ln(N / (df + 1))`; not clamped, so terms in every document score below zero
fn idf(total_documents: f64, document_count: usize) -> f64 {
    (total_documents / (document_count as f64 + 1.0)).ln()
}

fn cache_key<S: AsRef<str>>(documents: &[S], options: &ExtractionOptions) -> Result<String, AppError> {
    let mut hasher = Sha256::new();
    for doc in documents {
        hasher.update(doc.as_ref().as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update(serde_json::to_vec(options)?);
    Ok(format!("{:x}", hasher.finalize()))
}
