use std::collections::BTreeSet;

use crate::retrieval::RetrievedChunk;

pub const DEFAULT_DEDUPE_THRESHOLD: f32 = 0.92;

/// Removes near-duplicate chunks before they reach the prompt.
///
/// Two chunks are duplicates when their similarity is strictly above the
/// threshold. Similarity is cosine over embeddings when both chunks carry one,
/// otherwise Jaccard overlap of lower-cased alphanumeric tokens.
#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    threshold: f32,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_THRESHOLD)
    }
}

impl Deduplicator {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Keeps the best-scored representative of every duplicate cluster.
    ///
    /// Representatives are chosen greedily by descending score (earlier index
    /// wins a tie). The output is ordered by each cluster's first occurrence in
    /// the input, which makes the operation idempotent.
    pub fn dedupe(&self, chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
        if chunks.len() < 2 {
            return chunks;
        }

        let token_sets: Vec<BTreeSet<String>> = chunks.iter().map(|c| tokenize(&c.text)).collect();

        let mut by_score: Vec<usize> = (0..chunks.len()).collect();
        by_score.sort_by(|&a, &b| chunks[b].score.total_cmp(&chunks[a].score).then(a.cmp(&b)));

        // (representative index, first occurrence of any cluster member)
        let mut clusters: Vec<(usize, usize)> = Vec::new();
        for candidate in by_score {
            let joined = clusters.iter_mut().find(|(kept, _)| {
                self.similarity(&chunks[*kept], &token_sets[*kept], &chunks[candidate], &token_sets[candidate])
                    > self.threshold
            });
            match joined {
                Some((_, first_seen)) => *first_seen = (*first_seen).min(candidate),
                None => clusters.push((candidate, candidate)),
            }
        }

        let dropped = chunks.len() - clusters.len();
        if dropped > 0 {
            tracing::debug!("Dedupe dropped {} near-duplicate chunk(s)", dropped);
        }

        clusters.sort_by_key(|&(_, first_seen)| first_seen);
        let mut slots: Vec<Option<RetrievedChunk>> = chunks.into_iter().map(Some).collect();
        clusters
            .into_iter()
            .filter_map(|(kept, _)| slots[kept].take())
            .collect()
    }

    fn similarity(
        &self,
        a: &RetrievedChunk,
        a_tokens: &BTreeSet<String>,
        b: &RetrievedChunk,
        b_tokens: &BTreeSet<String>,
    ) -> f32 {
        match (&a.embedding, &b.embedding) {
            (Some(left), Some(right)) if left.len() == right.len() && !left.is_empty() => {
                cosine(left, right)
            }
            _ => jaccard(a_tokens, b_tokens),
        }
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        // Two token-less chunks carry the same (absent) information.
        return 1.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            source_id: id.to_string(),
            text: text.to_string(),
            score,
            embedding: None,
        }
    }

    fn embedded(id: &str, score: f32, vector: Vec<f32>) -> RetrievedChunk {
        RetrievedChunk {
            source_id: id.to_string(),
            text: format!("distinct text {}", id),
            score,
            embedding: Some(vector),
        }
    }

    fn ids(chunks: &[RetrievedChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.source_id.as_str()).collect()
    }

    #[test]
    fn keeps_higher_score_at_first_occurrence_position() {
        let input = vec![
            chunk("a", "Hold the power button for ten seconds.", 0.6),
            chunk("b", "Firmware updates are installed from the settings page.", 0.7),
            chunk("c", "hold the POWER button for ten seconds", 0.9),
        ];
        let out = Deduplicator::default().dedupe(input);
        // "c" wins the cluster but sits where "a" first appeared.
        assert_eq!(ids(&out), vec!["c", "b"]);
    }

    #[test]
    fn equal_scores_keep_earlier_chunk() {
        let input = vec![
            chunk("first", "reset the router", 0.5),
            chunk("second", "Reset the router!", 0.5),
        ];
        let out = Deduplicator::default().dedupe(input);
        assert_eq!(ids(&out), vec!["first"]);
    }

    #[test]
    fn threshold_is_strict() {
        // 12 shared tokens out of 13 → 0.923; 11 of 12 → 0.9166.
        let base = "a b c d e f g h i j k l";
        let above = Deduplicator::new(0.92).dedupe(vec![
            chunk("x", base, 0.5),
            chunk("y", &format!("{} m", base), 0.4),
        ]);
        assert_eq!(above.len(), 1);

        let below = Deduplicator::new(0.92).dedupe(vec![
            chunk("x", "a b c d e f g h i j k", 0.5),
            chunk("y", "a b c d e f g h i j k l", 0.4),
        ]);
        assert_eq!(below.len(), 2);
    }

    #[test]
    fn embeddings_take_precedence_over_text() {
        let out = Deduplicator::default().dedupe(vec![
            embedded("a", 0.4, vec![1.0, 0.0, 0.0]),
            embedded("b", 0.8, vec![0.99, 0.01, 0.0]),
            embedded("c", 0.3, vec![0.0, 1.0, 0.0]),
        ]);
        assert_eq!(ids(&out), vec!["b", "c"]);

        // Mixed: one side lacks an embedding, so identical text decides.
        let mut plain = chunk("p", "distinct text a", 0.1);
        plain.embedding = None;
        let out = Deduplicator::default().dedupe(vec![embedded("a", 0.4, vec![1.0, 0.0]), plain]);
        assert_eq!(ids(&out), vec!["a"]);
    }

    #[test]
    fn dedupe_is_idempotent() {
        let input = vec![
            chunk("a", "the quick brown fox", 0.3),
            chunk("b", "The quick brown fox.", 0.8),
            chunk("c", "lorem ipsum dolor", 0.6),
            chunk("d", "lorem ipsum dolor", 0.6),
            chunk("e", "entirely unrelated manual text", 0.1),
        ];
        let dedupe = Deduplicator::default();
        let once = dedupe.dedupe(input);
        let twice = dedupe.dedupe(once.clone());
        assert_eq!(once, twice);
        assert_eq!(ids(&once), vec!["b", "c", "e"]);
    }

    #[test]
    fn empty_and_single_inputs_pass_through() {
        assert!(Deduplicator::default().dedupe(Vec::new()).is_empty());
        let one = vec![chunk("solo", "text", 0.1)];
        assert_eq!(Deduplicator::default().dedupe(one.clone()), one);
    }
}
