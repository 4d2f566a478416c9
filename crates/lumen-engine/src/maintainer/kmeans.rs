//! Cosine k-means used to group sibling summaries

use lumen_persist::cosine_similarity;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

fn centroid(points: &[&Vec<f32>]) -> Vec<f32> {
    let dim = points.first().map(|p| p.len()).unwrap_or(0);
    let mut sum = vec![0.0f32; dim];
    for p in points {
        for (s, v) in sum.iter_mut().zip(p.iter()) {
            *s += v;
        }
    }
    let n = points.len().max(1) as f32;
    sum.iter_mut().for_each(|s| *s /= n);
    sum
}

/// k-means++ seeding from a fixed seed so retries pick the same centroids
fn seed_centroids(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids = vec![points[0].clone()];
    while centroids.len() < k {
        let weights: Vec<f32> = points
            .iter()
            .map(|p| {
                centroids
                    .iter()
                    .map(|c| distance(p, c))
                    .fold(f32::MAX, f32::min)
                    .max(0.0)
            })
            .collect();
        let total: f32 = weights.iter().sum();
        if total <= f32::EPSILON {
            break;
        }
        let mut target = rng.gen::<f32>() * total;
        let mut chosen = points.len() - 1;
        for (idx, w) in weights.iter().enumerate() {
            if target <= *w {
                chosen = idx;
                break;
            }
            target -= w;
        }
        centroids.push(points[chosen].clone());
    }
    centroids
}

/// Cluster label per point; at most `k` distinct labels
pub fn cluster(points: &[Vec<f32>], k: usize, max_iters: usize, seed: u64) -> Vec<usize> {
    if points.is_empty() {
        return Vec::new();
    }
    let k = k.clamp(1, points.len());
    if k == 1 {
        return vec![0; points.len()];
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = seed_centroids(points, k, &mut rng);
    let mut labels = vec![0usize; points.len()];

    for _ in 0..max_iters.max(1) {
        let mut changed = false;
        for (idx, p) in points.iter().enumerate() {
            let best = centroids
                .iter()
                .enumerate()
                .map(|(c, centroid)| (c, distance(p, centroid)))
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(c, _)| c)
                .unwrap_or(0);
            if labels[idx] != best {
                labels[idx] = best;
                changed = true;
            }
        }
        for (c, slot) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f32>> = points
                .iter()
                .zip(labels.iter())
                .filter(|(_, l)| **l == c)
                .map(|(p, _)| p)
                .collect();
            if !members.is_empty() {
                *slot = centroid(&members);
            }
        }
        if !changed {
            break;
        }
    }
    labels
}

/// Turn labels over an ordered sequence into contiguous runs of indices.
///
/// Adjacent items sharing a label form one run; a run of one is folded into
/// whichever neighbour run is closer, so every group has at least two members
/// when the input does.
pub fn contiguous_groups(points: &[Vec<f32>], labels: &[usize]) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    for (idx, label) in labels.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if labels[run[0]] == *label => run.push(idx),
            _ => runs.push(vec![idx]),
        }
    }
    if points.len() < 2 {
        return runs;
    }

    let mut i = 0;
    while i < runs.len() {
        if runs[i].len() > 1 || runs.len() == 1 {
            i += 1;
            continue;
        }
        let single = runs[i][0];
        let left = i.checked_sub(1).map(|l| distance(&points[single], &points[*runs[l].last().unwrap_or(&single)]));
        let right = runs
            .get(i + 1)
            .map(|r| distance(&points[single], &points[r[0]]));
        let merge_left = match (left, right) {
            (Some(l), Some(r)) => l <= r,
            (Some(_), None) => true,
            _ => false,
        };
        let run = runs.remove(i);
        if merge_left {
            runs[i - 1].extend(run);
        } else {
            let mut merged = run;
            merged.extend(runs[i].drain(..));
            runs[i] = merged;
        }
        i = i.saturating_sub(1);
    }
    runs
}
