//! Token-overlap similarity between articles.
//!
//! Text is lowercased, split on non-alphanumerics and stripped of English
//! stop words. Cosine compares term-frequency vectors; Jaccard compares the
//! token sets. Titles are counted twice so headline overlap dominates.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::storage::Article;
use crate::util::truncate_chars;

/// Body text beyond this many characters does not contribute tokens
const MAX_BODY_CHARS: usize = 5_000;

const DEFAULT_CACHE_CAPACITY: usize = 2_048;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "before", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "him", "his", "how", "if", "in", "into", "is", "it", "its", "just",
    "may", "more", "most", "new", "no", "not", "now", "of", "on", "one", "or", "other", "our",
    "out", "over", "said", "says", "she", "so", "some", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "those", "to", "up", "us", "was", "we", "were",
    "what", "when", "where", "which", "who", "will", "with", "would", "you", "your",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Cosine,
    Jaccard,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Some(Method::Cosine),
            "jaccard" => Some(Method::Jaccard),
            _ => None,
        }
    }
}

pub fn preprocess(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

// ============================================================================
// TokenBag
// ============================================================================

/// Term frequencies of one document with its precomputed L2 norm.
#[derive(Debug, Clone, Default)]
pub struct TokenBag {
    counts: HashMap<String, u32>,
    norm: f64,
}

impl TokenBag {
    pub fn from_tokens<I: IntoIterator<Item = String>>(tokens: I) -> Self {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_default() += 1;
        }
        let norm = counts
            .values()
            .map(|&c| f64::from(c) * f64::from(c))
            .sum::<f64>()
            .sqrt();
        Self { counts, norm }
    }

    pub fn from_text(text: &str) -> Self {
        Self::from_tokens(preprocess(text))
    }

    /// Title twice, then description and the head of the body.
    pub fn from_article(article: &Article) -> Self {
        let mut tokens = preprocess(&article.title);
        tokens.extend(tokens.clone());
        if let Some(description) = &article.description {
            tokens.extend(preprocess(description));
        }
        if let Some(content) = &article.content {
            tokens.extend(preprocess(truncate_chars(content, MAX_BODY_CHARS)));
        }
        Self::from_tokens(tokens)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }
}

pub fn cosine(a: &TokenBag, b: &TokenBag) -> f64 {
    if a.is_empty() || b.is_empty() || a.norm == 0.0 || b.norm == 0.0 {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .counts
        .iter()
        .filter_map(|(t, &c)| large.counts.get(t).map(|&d| f64::from(c) * f64::from(d)))
        .sum();
    (dot / (a.norm * b.norm)).clamp(0.0, 1.0)
}

pub fn jaccard(a: &TokenBag, b: &TokenBag) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let left: HashSet<&String> = a.counts.keys().collect();
    let right: HashSet<&String> = b.counts.keys().collect();
    let intersection = left.intersection(&right).count();
    let union = left.len() + right.len() - intersection;
    intersection as f64 / union as f64
}

pub fn score(method: Method, a: &TokenBag, b: &TokenBag) -> f64 {
    match method {
        Method::Cosine => cosine(a, b),
        Method::Jaccard => jaccard(a, b),
    }
}

// ============================================================================
// SimilarityIndex
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ScoredArticle {
    #[serde(flatten)]
    pub article: Article,
    pub similarity: f64,
}

/// Ranks candidate articles against a query, memoizing token bags.
///
/// Bags are keyed by `(article id, fetched_at)`. Upserts that refresh an
/// article's text keep its `fetched_at`, so a cached bag can lag behind an
/// edit until it is evicted.
pub struct SimilarityIndex {
    cache: Mutex<LruCache<(i64, i64), Arc<TokenBag>>>,
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl SimilarityIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn bag_for(&self, article: &Article) -> Arc<TokenBag> {
        let key = (article.id, article.fetched_at);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(bag) = cache.get(&key) {
                return Arc::clone(bag);
            }
        }

        let bag = Arc::new(TokenBag::from_article(article));
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, Arc::clone(&bag));
        }
        bag
    }

    /// Score candidates against `query`, keeping those at or above
    /// `threshold`, best first with ties broken by ascending id.
    pub fn rank(
        &self,
        query: &TokenBag,
        candidates: Vec<Article>,
        method: Method,
        threshold: f64,
        limit: usize,
    ) -> Vec<ScoredArticle> {
        if query.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<ScoredArticle> = candidates
            .into_iter()
            .filter_map(|article| {
                let bag = self.bag_for(&article);
                let similarity = score(method, query, &bag);
                (similarity > 0.0 && similarity >= threshold)
                    .then_some(ScoredArticle { article, similarity })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.article.id.cmp(&b.article.id))
        });
        scored.truncate(limit);
        scored
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}
