use lumen_persist::cosine_similarity;

/// Maximal marginal relevance selection
///
/// `items` are `(relevance, embedding)` pairs, already in tie-break order. Returns
/// the indices of up to `k` items. Items without an embedding never penalise
/// or get penalised, so they compete on relevance alone.
pub fn mmr_select(items: &[(f32, &[f32])], lambda: f32, k: usize) -> Vec<usize> {
    let lambda = lambda.clamp(0.0, 1.0);
    let mut selected: Vec<usize> = Vec::with_capacity(k.min(items.len()));
    let mut remaining: Vec<usize> = (0..items.len()).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let (relevance, embedding) = items[idx];
            let redundancy = selected
                .iter()
                .map(|&s| {
                    let other = items[s].1;
                    if embedding.is_empty() || other.is_empty() {
                        0.0
                    } else {
                        cosine_similarity(embedding, other)
                    }
                })
                .fold(0.0f32, f32::max);
            let score = lambda * relevance - (1.0 - lambda) * redundancy;
            // strict comparison keeps the earlier item on ties
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        selected.push(remaining.remove(best_pos));
    }
    selected
}
