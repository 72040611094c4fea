use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// How many entries the top-hits and top-misses views return.
pub const TOP_N: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketScore {
    pub bucket: String,
    pub score: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketScores {
    pub hits: u64,
    pub misses: u64,
}

/// Hit and miss counters for dynamic buckets, per namespace.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    namespaces: Arc<RwLock<HashMap<String, HashMap<String, BucketScores>>>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, namespace: &str, bucket: &str, admitted: bool) {
        let mut namespaces = self.namespaces.write().await;
        let scores = namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(bucket.to_string())
            .or_default();

        if admitted {
            scores.hits += 1;
        } else {
            scores.misses += 1;
        }
    }

    pub async fn top_hits(&self, namespace: &str) -> Vec<BucketScore> {
        self.top(namespace, |s| s.hits).await
    }

    pub async fn top_misses(&self, namespace: &str) -> Vec<BucketScore> {
        self.top(namespace, |s| s.misses).await
    }

    pub async fn bucket_scores(&self, namespace: &str, bucket: &str) -> Option<BucketScores> {
        let namespaces = self.namespaces.read().await;
        namespaces.get(namespace).and_then(|b| b.get(bucket)).cloned()
    }

    /// Drops all counters of a namespace.
    pub async fn reset_namespace(&self, namespace: &str) {
        self.namespaces.write().await.remove(namespace);
    }

    async fn top(&self, namespace: &str, score: impl Fn(&BucketScores) -> u64) -> Vec<BucketScore> {
        let namespaces = self.namespaces.read().await;
        let Some(buckets) = namespaces.get(namespace) else {
            return Vec::new();
        };

        let mut scores: Vec<BucketScore> = buckets
            .iter()
            .map(|(bucket, s)| BucketScore {
                bucket: bucket.clone(),
                score: score(s),
            })
            .filter(|s| s.score > 0)
            .collect();

        scores.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.bucket.cmp(&b.bucket)));
        scores.truncate(TOP_N);
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_rank() {
        let stats = StatsCollector::new();
        for _ in 0..3 {
            stats.record("users", "alice", true).await;
        }
        stats.record("users", "bob", true).await;
        stats.record("users", "bob", false).await;

        let hits = stats.top_hits("users").await;
        assert_eq!(hits[0], BucketScore { bucket: "alice".into(), score: 3 });
        assert_eq!(hits[1], BucketScore { bucket: "bob".into(), score: 1 });

        let misses = stats.top_misses("users").await;
        assert_eq!(misses, vec![BucketScore { bucket: "bob".into(), score: 1 }]);

        assert_eq!(
            stats.bucket_scores("users", "bob").await,
            Some(BucketScores { hits: 1, misses: 1 })
        );
        assert!(stats.top_hits("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_top_is_bounded() {
        let stats = StatsCollector::new();
        for i in 0..(TOP_N + 5) {
            stats.record("ns", &format!("b{}", i), true).await;
        }
        assert_eq!(stats.top_hits("ns").await.len(), TOP_N);

        stats.reset_namespace("ns").await;
        assert!(stats.top_hits("ns").await.is_empty());
    }
}
