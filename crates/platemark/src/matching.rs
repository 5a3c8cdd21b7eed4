//! Brute-force descriptor matching with the Lowe ratio test and optional
//! cross-checking.

use crate::config::MatchingParams;
use crate::features::DescriptorSet;

/// A tentative correspondence between a template descriptor (`query`) and a
/// ROI descriptor (`train`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorMatch {
    pub query: usize,
    pub train: usize,
    pub distance: f32,
}

#[inline]
fn hamming(a: &[u8; 32], b: &[u8; 32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum::<u32>() as f32
}

#[inline]
fn l2(a: &[f32; 128], b: &[f32; 128]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Best and second-best train index/distance for one query row.
fn two_nearest<T, F: Fn(&T, &T) -> f32>(query: &T, train: &[T], dist: F) -> (usize, f32, f32) {
    let mut best_idx = 0usize;
    let mut best = f32::INFINITY;
    let mut second = f32::INFINITY;
    for (j, row) in train.iter().enumerate() {
        let d = dist(query, row);
        if d < best {
            second = best;
            best = d;
            best_idx = j;
        } else if d < second {
            second = d;
        }
    }
    (best_idx, best, second)
}

fn nearest_only<T, F: Fn(&T, &T) -> f32>(query: &T, train: &[T], dist: F) -> usize {
    let mut best_idx = 0usize;
    let mut best = f32::INFINITY;
    for (j, row) in train.iter().enumerate() {
        let d = dist(query, row);
        if d < best {
            best = d;
            best_idx = j;
        }
    }
    best_idx
}

fn match_rows<T, F: Fn(&T, &T) -> f32 + Copy>(
    template: &[T],
    roi: &[T],
    params: &MatchingParams,
    dist: F,
) -> Vec<DescriptorMatch> {
    if template.is_empty() || roi.is_empty() {
        return Vec::new();
    }
    let ratio = params.ratio_test_threshold as f32;
    let mut out = Vec::new();
    for (i, q) in template.iter().enumerate() {
        let (j, best, second) = two_nearest(q, roi, dist);
        // With a single candidate there is no second neighbour to test against.
        if second.is_finite() && best >= ratio * second {
            continue;
        }
        if params.cross_check && nearest_only(&roi[j], template, dist) != i {
            continue;
        }
        out.push(DescriptorMatch {
            query: i,
            train: j,
            distance: best,
        });
    }
    out
}

/// Match template descriptors against ROI descriptors.
///
/// Both sets must come from the same extractor family; a family mismatch
/// yields no matches.
pub fn match_descriptors(
    template: &DescriptorSet,
    roi: &DescriptorSet,
    params: &MatchingParams,
) -> Vec<DescriptorMatch> {
    if template.is_empty() || roi.is_empty() {
        return Vec::new();
    }
    match (template, roi) {
        (DescriptorSet::Binary(t), DescriptorSet::Binary(r)) => {
            match_rows(t, r, params, |a, b| hamming(a, b))
        }
        (DescriptorSet::Float(t), DescriptorSet::Float(r)) => {
            match_rows(t, r, params, |a, b| l2(a, b))
        }
        _ => Vec::new(),
    }
}
