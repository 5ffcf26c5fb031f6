use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::config::GroupingPolicy;
use crate::core::embedding::cosine_distance;
use crate::core::record::{PhotoRecord, SimilarityGroup};

/// Bands for locality-sensitive bucketing: four 16-bit slices of the
/// 64-bit hash. Pairs within Hamming distance 3 always share at least one
/// band; more distant pairs are found with decreasing probability, which
/// is the accepted trade for sub-quadratic candidate generation.
const LSH_BANDS: u32 = 4;

/// Union-find with path compression and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Similarity of one candidate pair. Hash-based Hamming percentage,
/// replaced by the embedding-derived score when the hash lands in the
/// ambiguous band and both records carry feature vectors. Pair scores are
/// independent of the grouping threshold, so raising the threshold can
/// only refine groups.
fn pair_similarity(a: &PhotoRecord, b: &PhotoRecord, policy: &GroupingPolicy) -> f64 {
    let (Some(fa), Some(fb)) = (a.fingerprint, b.fingerprint) else {
        return 0.0;
    };
    let hash_similarity = fa.similarity(&fb);

    let (band_low, band_high) = policy.refine_band;
    if hash_similarity >= band_low && hash_similarity < band_high {
        if let (Some(va), Some(vb)) = (&a.feature, &b.feature) {
            let refined = 100.0 * (1.0 - cosine_distance(va, vb));
            return refined.clamp(0.0, 100.0);
        }
    }
    hash_similarity
}

/// True when `a` beats `b` as group keeper: higher composite score, ties
/// broken by larger pixel area, then larger file size, then earliest
/// insertion order.
fn keeper_beats(a: &PhotoRecord, b: &PhotoRecord) -> bool {
    let score_a = a.quality.map(|q| q.score).unwrap_or(0.0);
    let score_b = b.quality.map(|q| q.score).unwrap_or(0.0);
    match score_a.total_cmp(&score_b) {
        Ordering::Greater => return true,
        Ordering::Less => return false,
        Ordering::Equal => {}
    }
    match a.pixel_area().cmp(&b.pixel_area()) {
        Ordering::Greater => return true,
        Ordering::Less => return false,
        Ordering::Equal => {}
    }
    match a.identity.file_size.cmp(&b.identity.file_size) {
        Ordering::Greater => return true,
        Ordering::Less => return false,
        Ordering::Equal => {}
    }
    a.insertion_index < b.insertion_index
}

/// Candidate pairs for comparison, as index pairs into `records`.
///
/// Small batches are compared all-pairs. Larger ones are bucketed by
/// hash band so comparison is restricted to likely matches.
fn candidate_pairs(records: &[&PhotoRecord], cutoff: usize) -> Vec<(usize, usize)> {
    let n = records.len();
    if n <= cutoff {
        let mut pairs = Vec::with_capacity(n.saturating_mul(n.saturating_sub(1)) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                pairs.push((i, j));
            }
        }
        return pairs;
    }

    let mut buckets: HashMap<(u32, u64), Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        let Some(fingerprint) = record.fingerprint else {
            continue;
        };
        for band in 0..LSH_BANDS {
            buckets
                .entry((band, fingerprint.band(band, LSH_BANDS)))
                .or_default()
                .push(i);
        }
    }

    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    let mut pairs = Vec::new();
    for members in buckets.values() {
        for (a, &i) in members.iter().enumerate() {
            for &j in &members[(a + 1)..] {
                let key = if i < j { (i, j) } else { (j, i) };
                if seen.insert(key) {
                    pairs.push(key);
                }
            }
        }
    }
    pairs
}

/// Cluster completed records into near-duplicate groups.
///
/// Pure function of its inputs: records are never mutated, and re-running
/// with a different threshold is a side-effect-free recomputation. Groups
/// are transitive closures under "similarity >= threshold", not cliques.
/// Only groups with two or more members are returned.
pub fn group_records(records: &[PhotoRecord], policy: &GroupingPolicy) -> Vec<SimilarityGroup> {
    let eligible: Vec<&PhotoRecord> = records
        .iter()
        .filter(|r| r.is_done() && r.fingerprint.is_some())
        .collect();
    if eligible.len() < 2 {
        return Vec::new();
    }

    let pairs = candidate_pairs(&eligible, policy.direct_compare_cutoff);

    let mut uf = UnionFind::new(eligible.len());
    for (i, j) in pairs {
        if pair_similarity(eligible[i], eligible[j], policy) >= policy.threshold {
            uf.union(i, j);
        }
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..eligible.len() {
        let root = uf.find(i);
        components.entry(root).or_default().push(i);
    }

    let mut groups: Vec<SimilarityGroup> = components
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|mut members| {
            members.sort_by_key(|&i| eligible[i].insertion_index);

            let keeper_idx = members
                .iter()
                .copied()
                .reduce(|best, candidate| {
                    if keeper_beats(eligible[candidate], eligible[best]) {
                        candidate
                    } else {
                        best
                    }
                })
                .expect("groups have at least two members");

            let mut similarity_sum = 0.0;
            let mut pair_count = 0u32;
            for (a, &i) in members.iter().enumerate() {
                for &j in &members[(a + 1)..] {
                    similarity_sum += pair_similarity(eligible[i], eligible[j], policy);
                    pair_count += 1;
                }
            }

            SimilarityGroup {
                id: Uuid::new_v4(),
                members: members
                    .iter()
                    .map(|&i| eligible[i].insertion_index)
                    .collect(),
                keeper: eligible[keeper_idx].insertion_index,
                mean_similarity: similarity_sum / f64::from(pair_count.max(1)),
            }
        })
        .collect();

    // Deterministic output order: by each group's earliest member.
    groups.sort_by(|a, b| a.members[0].cmp(&b.members[0]));
    groups
}
