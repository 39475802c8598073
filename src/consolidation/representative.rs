//! Picking one label to stand for a consolidated group.

use serde::{Deserialize, Serialize};

use crate::embedding::euclidean_distance;

/// How a cluster's canonical label is chosen among its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepresentativePolicy {
    /// Most frequent raw label; ties go to the first seen.
    #[default]
    Frequency,
    /// Member closest to the mean embedding; ties go to the first seen.
    Centroid,
}

impl std::str::FromStr for RepresentativePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "frequency" => Ok(RepresentativePolicy::Frequency),
            "centroid" => Ok(RepresentativePolicy::Centroid),
            other => Err(format!("unknown representative policy '{}'", other)),
        }
    }
}

/// Select the representative of `members`.
///
/// `members` are indices into `counts` and `embeddings`, ascending in
/// first-seen order. Returns one of `members`.
pub fn select_representative(
    members: &[usize],
    policy: RepresentativePolicy,
    counts: &[u64],
    embeddings: &[Vec<f32>],
) -> Option<usize> {
    let (&first, rest) = members.split_first()?;
    if rest.is_empty() {
        return Some(first);
    }

    match policy {
        RepresentativePolicy::Frequency => {
            let mut best = first;
            for &m in rest {
                if counts[m] > counts[best] {
                    best = m;
                }
            }
            Some(best)
        }
        RepresentativePolicy::Centroid => {
            let dim = embeddings[first].len();
            let mut mean = vec![0.0f32; dim];
            for &m in members {
                for (acc, v) in mean.iter_mut().zip(&embeddings[m]) {
                    *acc += v;
                }
            }
            let n = members.len() as f32;
            mean.iter_mut().for_each(|v| *v /= n);

            let mut best = first;
            let mut best_d = euclidean_distance(&embeddings[first], &mean);
            for &m in rest {
                let d = euclidean_distance(&embeddings[m], &mean);
                if d < best_d {
                    best_d = d;
                    best = m;
                }
            }
            Some(best)
        }
    }
}
