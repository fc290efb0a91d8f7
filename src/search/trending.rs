//! Trending topic scoring.
//!
//! ```text
//! score = clamp(0.4 * log10(count) + 0.4 * (sources / 10) + 0.2 * |avg_sentiment|, 0, 1)
//! ```

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;

use crate::storage::{Database, TopicSample, TrendingTopic};

const COUNT_WEIGHT: f64 = 0.4;
const SOURCE_WEIGHT: f64 = 0.4;
const SENTIMENT_WEIGHT: f64 = 0.2;
/// Distinct sources at which source diversity saturates
const SOURCE_SATURATION: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct TrendingParams {
    pub window_hours: i64,
    pub min_articles: i64,
    pub top_n: usize,
}

impl Default for TrendingParams {
    fn default() -> Self {
        Self {
            window_hours: 24,
            min_articles: 2,
            top_n: 20,
        }
    }
}

pub fn trending_score(article_count: i64, source_count: i64, avg_sentiment: f64) -> f64 {
    if article_count <= 0 {
        return 0.0;
    }
    let sentiment = if avg_sentiment.is_finite() {
        avg_sentiment.abs()
    } else {
        0.0
    };
    let raw = COUNT_WEIGHT * (article_count as f64).log10()
        + SOURCE_WEIGHT * (source_count.max(0) as f64 / SOURCE_SATURATION)
        + SENTIMENT_WEIGHT * sentiment;
    raw.clamp(0.0, 1.0)
}

#[derive(Default)]
struct TopicAccumulator {
    articles: HashSet<i64>,
    sources: HashSet<i64>,
    sentiment_sum: f64,
    sentiment_n: u32,
}

/// Rank topics from (article, topic) samples.
///
/// Each article counts once per topic; topics seen in fewer than
/// `min_articles` articles are dropped. Ordered by score, then article
/// count, then topic name.
pub fn compute_trending(
    samples: &[TopicSample],
    params: &TrendingParams,
    now: i64,
) -> Vec<TrendingTopic> {
    let mut by_topic: BTreeMap<String, TopicAccumulator> = BTreeMap::new();

    for sample in samples {
        let topic = sample.topic.trim().to_lowercase();
        if topic.is_empty() {
            continue;
        }
        let acc = by_topic.entry(topic).or_default();
        if !acc.articles.insert(sample.article_id) {
            continue;
        }
        acc.sources.insert(sample.source_id);
        if let Some(score) = sample.sentiment_score {
            acc.sentiment_sum += score;
            acc.sentiment_n += 1;
        }
    }

    let mut topics: Vec<TrendingTopic> = by_topic
        .into_iter()
        .filter(|(_, acc)| acc.articles.len() as i64 >= params.min_articles.max(1))
        .map(|(topic, acc)| {
            let article_count = acc.articles.len() as i64;
            let source_count = acc.sources.len() as i64;
            let avg_sentiment = if acc.sentiment_n == 0 {
                0.0
            } else {
                acc.sentiment_sum / f64::from(acc.sentiment_n)
            };
            TrendingTopic {
                score: trending_score(article_count, source_count, avg_sentiment),
                topic,
                article_count,
                source_count,
                avg_sentiment,
                window_hours: params.window_hours,
                computed_at: now,
            }
        })
        .collect();

    topics.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.article_count.cmp(&a.article_count))
            .then_with(|| a.topic.cmp(&b.topic))
    });
    topics.truncate(params.top_n);
    topics
}

/// Recompute and persist the ranking for `params.window_hours`.
pub async fn refresh_trending(
    db: &Database,
    params: &TrendingParams,
    now: i64,
) -> Result<Vec<TrendingTopic>> {
    let since = now - params.window_hours.max(1) * 3_600;
    let samples = db.trending_inputs(since).await?;
    let topics = compute_trending(&samples, params, now);
    db.replace_trending_topics(params.window_hours, &topics)
        .await?;

    tracing::info!(
        window_hours = params.window_hours,
        samples = samples.len(),
        topics = topics.len(),
        "Trending topics recomputed"
    );
    Ok(topics)
}
