// Duplicate grouping over embedding vectors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::embedding::EmbeddingVector;

/// How videos are partitioned into duplicate groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingStrategy {
    /// Single pass, compare against each group's seed only. Order dependent and not
    /// transitive.
    #[default]
    Greedy,
    /// Connected components of the "similarity above threshold" graph.
    Transitive,
}

/// Videos judged to show the same content. `members[0]` is the representative, the
/// first member in enumeration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub members: Vec<PathBuf>,
}

impl DuplicateGroup {
    pub fn representative(&self) -> &PathBuf {
        &self.members[0]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_duplicate(&self) -> bool {
        self.members.len() > 1
    }
}

/// Cosine of the angle between `a` and `b`, in [-1, 1]. Zero when either vector has
/// zero length or the dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32
}

pub struct DuplicateDetector {
    pub threshold: f32,
    pub strategy: GroupingStrategy,
}

impl DuplicateDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            strategy: GroupingStrategy::Greedy,
        }
    }

    pub fn with_strategy(mut self, strategy: GroupingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Partition `embeddings` (in enumeration order) into groups, singletons included.
    /// Both strategies compare pairs, so cost is quadratic in the number of embedded
    /// videos; fine for one run's directory scan, not for a library-wide index.
    pub fn group(&self, embeddings: &[(PathBuf, EmbeddingVector)]) -> Vec<DuplicateGroup> {
        match self.strategy {
            GroupingStrategy::Greedy => self.group_greedy(embeddings),
            GroupingStrategy::Transitive => self.group_transitive(embeddings),
        }
    }

    fn group_greedy(&self, embeddings: &[(PathBuf, EmbeddingVector)]) -> Vec<DuplicateGroup> {
        let mut claimed = vec![false; embeddings.len()];
        let mut groups = Vec::new();

        for (i, (seed_path, seed)) in embeddings.iter().enumerate() {
            if claimed[i] {
                continue;
            }
            claimed[i] = true;
            let mut members = vec![seed_path.clone()];

            for (j, (path, vector)) in embeddings.iter().enumerate() {
                if claimed[j] {
                    continue;
                }
                if cosine_similarity(seed, vector) > self.threshold {
                    claimed[j] = true;
                    members.push(path.clone());
                }
            }

            groups.push(DuplicateGroup { members });
        }

        groups
    }

    fn group_transitive(&self, embeddings: &[(PathBuf, EmbeddingVector)]) -> Vec<DuplicateGroup> {
        let mut sets = DisjointSet::new(embeddings.len());
        for i in 0..embeddings.len() {
            for j in (i + 1)..embeddings.len() {
                if cosine_similarity(&embeddings[i].1, &embeddings[j].1) > self.threshold {
                    sets.union(i, j);
                }
            }
        }

        // Groups ordered by their first member, members in enumeration order.
        let mut slot_of_root: Vec<Option<usize>> = vec![None; embeddings.len()];
        let mut groups: Vec<DuplicateGroup> = Vec::new();
        for (i, (path, _)) in embeddings.iter().enumerate() {
            let root = sets.find(i);
            match slot_of_root[root] {
                Some(slot) => groups[slot].members.push(path.clone()),
                None => {
                    slot_of_root[root] = Some(groups.len());
                    groups.push(DuplicateGroup {
                        members: vec![path.clone()],
                    });
                }
            }
        }

        groups
    }
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit vector at `degrees` in the plane; cos(angle difference) is the similarity.
    fn at(degrees: f32) -> EmbeddingVector {
        let r = degrees.to_radians();
        vec![r.cos(), r.sin()]
    }

    fn named(entries: &[(&str, EmbeddingVector)]) -> Vec<(PathBuf, EmbeddingVector)> {
        entries
            .iter()
            .map(|(name, v)| (PathBuf::from(format!("/v/{name}")), v.clone()))
            .collect()
    }

    fn member_names(groups: &[DuplicateGroup]) -> Vec<Vec<String>> {
        groups
            .iter()
            .map(|g| {
                g.members
                    .iter()
                    .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                    .collect()
            })
            .collect()
    }

    fn flagged(groups: &[DuplicateGroup]) -> usize {
        groups.iter().filter(|g| g.is_duplicate()).map(|g| g.len() - 1).sum()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_pair_above_threshold_with_singleton() {
        // cos(14.07°) ≈ 0.97, cos(66.42°) ≈ 0.40
        let v1 = vec![1.0, 0.0];
        let v2 = vec![0.97, (1.0f32 - 0.97 * 0.97).sqrt()];
        let v3 = vec![0.40, (1.0f32 - 0.40 * 0.40).sqrt()];
        let embeddings = named(&[("v1.mp4", v1), ("v2.mp4", v2), ("v3.mp4", v3)]);

        let groups = DuplicateDetector::new(0.95).group(&embeddings);

        assert_eq!(
            member_names(&groups),
            vec![vec!["v1.mp4", "v2.mp4"], vec!["v3.mp4"]]
        );
        assert_eq!(groups[0].representative(), &PathBuf::from("/v/v1.mp4"));
    }

    #[test]
    fn test_threshold_is_strict() {
        let embeddings = named(&[("a", vec![1.0, 0.0]), ("b", vec![1.0, 0.0])]);

        assert_eq!(DuplicateDetector::new(1.0).group(&embeddings).len(), 2);
        assert_eq!(DuplicateDetector::new(0.99).group(&embeddings).len(), 1);
    }

    #[test]
    fn test_greedy_compares_against_seed_only() {
        // a~b and b~c are close, a~c is not.
        let embeddings = named(&[("a", at(0.0)), ("b", at(15.0)), ("c", at(30.0))]);
        let threshold = 20.0f32.to_radians().cos();

        let greedy = DuplicateDetector::new(threshold).group(&embeddings);
        let transitive = DuplicateDetector::new(threshold)
            .with_strategy(GroupingStrategy::Transitive)
            .group(&embeddings);

        assert_eq!(member_names(&greedy), vec![vec!["a", "b"], vec!["c"]]);
        assert_eq!(member_names(&transitive), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_greedy_depends_on_enumeration_order() {
        let threshold = 20.0f32.to_radians().cos();
        let forward = named(&[("a", at(0.0)), ("b", at(15.0)), ("c", at(30.0))]);
        let middle_first = named(&[("b", at(15.0)), ("a", at(0.0)), ("c", at(30.0))]);

        let detector = DuplicateDetector::new(threshold);

        assert_eq!(detector.group(&forward).len(), 2);
        assert_eq!(member_names(&detector.group(&middle_first)), vec![vec!["b", "a", "c"]]);
    }

    #[test]
    fn test_every_video_in_exactly_one_group() {
        let angles = [0.0, 3.0, 50.0, 52.0, 120.0, 1.0, 51.0, 200.0];
        let embeddings: Vec<(PathBuf, EmbeddingVector)> = angles
            .iter()
            .enumerate()
            .map(|(i, &deg)| (PathBuf::from(format!("{i}.mp4")), at(deg)))
            .collect();

        for strategy in [GroupingStrategy::Greedy, GroupingStrategy::Transitive] {
            let groups = DuplicateDetector::new(0.99)
                .with_strategy(strategy)
                .group(&embeddings);
            let mut all: Vec<PathBuf> = groups.iter().flat_map(|g| g.members.clone()).collect();
            assert_eq!(all.len(), embeddings.len());
            all.sort();
            all.dedup();
            assert_eq!(all.len(), embeddings.len());
            assert!(groups.iter().all(|g| !g.is_empty()));
        }
    }

    #[test]
    fn test_transitive_threshold_monotonicity() {
        let angles = [0.0, 4.0, 9.0, 15.0, 40.0, 43.0, 47.0, 90.0, 92.0, 180.0];
        let embeddings: Vec<(PathBuf, EmbeddingVector)> = angles
            .iter()
            .enumerate()
            .map(|(i, &deg)| (PathBuf::from(format!("{i}.mp4")), at(deg)))
            .collect();

        let mut previous: Option<(usize, usize)> = None;
        for step in 0..=20 {
            let threshold = 0.90 + step as f32 * 0.005;
            let groups = DuplicateDetector::new(threshold)
                .with_strategy(GroupingStrategy::Transitive)
                .group(&embeddings);
            let largest = groups.iter().map(DuplicateGroup::len).max().unwrap();
            let current = (largest, flagged(&groups));
            if let Some((prev_largest, prev_flagged)) = previous {
                assert!(current.0 <= prev_largest, "group grew at {threshold}");
                assert!(current.1 <= prev_flagged, "flagged grew at {threshold}");
            }
            previous = Some(current);
        }
    }

    #[test]
    fn test_greedy_threshold_monotonicity_on_separated_clusters() {
        // Three tight clusters far apart from each other.
        let embeddings = named(&[
            ("a1", at(0.0)),
            ("b1", at(90.0)),
            ("a2", at(1.0)),
            ("c1", at(200.0)),
            ("b2", at(91.5)),
            ("a3", at(2.5)),
            ("c2", at(200.5)),
        ]);

        let mut previous: Option<(usize, usize)> = None;
        for threshold in [0.90, 0.99, 0.999, 0.9995, 0.99999] {
            let groups = DuplicateDetector::new(threshold).group(&embeddings);
            let largest = groups.iter().map(DuplicateGroup::len).max().unwrap();
            let current = (largest, flagged(&groups));
            if let Some((prev_largest, prev_flagged)) = previous {
                assert!(current.0 <= prev_largest);
                assert!(current.1 <= prev_flagged);
            }
            previous = Some(current);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(DuplicateDetector::new(0.95).group(&[]).is_empty());
        assert!(
            DuplicateDetector::new(0.95)
                .with_strategy(GroupingStrategy::Transitive)
                .group(&[])
                .is_empty()
        );
    }
}
