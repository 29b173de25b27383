/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Filter-then-rank placement policy.

use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::warn;

use common::spec::Placement;

use super::expr::{evaluate, Value};

/// Fewest containers first.
pub const DEFAULT_RANK: &str = "ncont";

/// A candidate worker as seen by the placement policy.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub tags: Vec<String>,
    pub host: String,
    pub domain: String,
    pub containers: usize,
}

#[derive(Debug, Default)]
pub struct PlacementPolicy;

impl PlacementPolicy {
    /// Select a worker for an instance with the given placement
    /// options, or `None` when no worker qualifies.
    ///
    /// Workers failing any requirement are filtered out; the rest are
    /// ranked by the rank expression, lower score first, ties broken
    /// stably by input order.
    pub fn select(&self, candidates: &[Candidate], placement: Option<&Placement>) -> Option<String> {
        let requirements: &[String] = placement.map(|p| p.requirements.as_slice()).unwrap_or(&[]);
        let rank = placement
            .and_then(|p| p.rank.as_deref())
            .unwrap_or(DEFAULT_RANK);

        let mut ranked: Vec<(f64, &Candidate)> = candidates
            .iter()
            .filter(|candidate| Self::qualifies(candidate, requirements))
            .filter_map(|candidate| Self::score(candidate, rank).map(|score| (score, candidate)))
            .collect();
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        ranked.first().map(|(_, candidate)| candidate.name.clone())
    }

    fn qualifies(candidate: &Candidate, requirements: &[String]) -> bool {
        if requirements.is_empty() {
            return true;
        }
        let vars = filter_vars(candidate);
        requirements.iter().all(|req| match evaluate(req, &vars) {
            Ok(value) => value.truthy(),
            Err(err) => {
                warn!(
                    worker = %candidate.name,
                    requirement = %req,
                    "requirement failed to evaluate, excluding worker: {err}"
                );
                false
            }
        })
    }

    fn score(candidate: &Candidate, rank: &str) -> Option<f64> {
        let vars = rank_vars(candidate);
        match evaluate(rank, &vars) {
            Ok(Value::Num(score)) => Some(score),
            Ok(_) => {
                warn!(worker = %candidate.name, rank = %rank, "rank is not numeric, excluding worker");
                None
            }
            Err(err) => {
                warn!(worker = %candidate.name, rank = %rank, "rank failed to evaluate, excluding worker: {err}");
                None
            }
        }
    }
}

fn filter_vars(candidate: &Candidate) -> HashMap<String, Value> {
    HashMap::from([
        (
            String::from("tags"),
            Value::List(
                candidate
                    .tags
                    .iter()
                    .map(|tag| Value::Str(tag.clone()))
                    .collect(),
            ),
        ),
        (String::from("host"), Value::Str(candidate.host.clone())),
        (String::from("domain"), Value::Str(candidate.domain.clone())),
    ])
}

fn rank_vars(candidate: &Candidate) -> HashMap<String, Value> {
    HashMap::from([(
        String::from("ncont"),
        Value::Num(candidate.containers as f64),
    )])
}

//Unit Test Cases
#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, tags: &[&str], containers: usize) -> Candidate {
        Candidate {
            name: name.to_owned(),
            tags: tags.iter().map(|t| (*t).to_owned()).collect(),
            host: format!("{}.example", name),
            domain: String::from("dc1"),
            containers,
        }
    }

    fn placement(requirements: &[&str], rank: Option<&str>) -> Placement {
        Placement {
            requirements: requirements.iter().map(|r| (*r).to_owned()).collect(),
            rank: rank.map(str::to_owned),
        }
    }

    #[test]
    fn test_default_rank_prefers_fewest_containers() {
        let candidates = [
            candidate("hype1", &[], 5),
            candidate("hype2", &[], 1),
            candidate("hype3", &[], 3),
        ];
        let policy = PlacementPolicy;
        assert_eq!(
            policy.select(&candidates, None),
            Some(String::from("hype2"))
        );
    }

    #[test]
    fn test_ties_are_stable() {
        let candidates = [candidate("hype1", &[], 2), candidate("hype2", &[], 2)];
        let policy = PlacementPolicy;
        assert_eq!(
            policy.select(&candidates, None),
            Some(String::from("hype1"))
        );
    }

    #[test]
    fn test_every_requirement_must_hold() {
        let candidates = [
            candidate("hype1", &["ssd"], 0),
            candidate("hype2", &["ssd", "gpu"], 9),
        ];
        let policy = PlacementPolicy;
        let options = placement(&["'ssd' in tags", "'gpu' in tags"], None);
        assert_eq!(
            policy.select(&candidates, Some(&options)),
            Some(String::from("hype2"))
        );
    }

    #[test]
    fn test_no_qualifying_worker() {
        let candidates = [candidate("hype1", &["ssd"], 0)];
        let policy = PlacementPolicy;
        let options = placement(&["'gpu' in tags"], None);
        assert_eq!(policy.select(&candidates, Some(&options)), None);
    }

    #[test]
    fn test_custom_rank_expression() {
        let candidates = [candidate("hype1", &[], 1), candidate("hype2", &[], 4)];
        let policy = PlacementPolicy;
        // Inverted preference: most containers first.
        let options = placement(&[], Some("-ncont"));
        assert_eq!(
            policy.select(&candidates, Some(&options)),
            Some(String::from("hype2"))
        );
    }

    #[test]
    fn test_broken_requirement_excludes_worker() {
        let candidates = [candidate("hype1", &[], 0), candidate("hype2", &[], 5)];
        let policy = PlacementPolicy;
        // References an unknown symbol; no worker can satisfy it.
        let options = placement(&["cpus > 4"], None);
        assert_eq!(policy.select(&candidates, Some(&options)), None);
    }

    #[test]
    fn test_broken_rank_excludes_worker() {
        let candidates = [candidate("hype1", &[], 0)];
        let policy = PlacementPolicy;
        let options = placement(&[], Some("host"));
        assert_eq!(policy.select(&candidates, Some(&options)), None);
    }

    #[test]
    fn test_empty_candidate_set() {
        let policy = PlacementPolicy;
        assert_eq!(policy.select(&[], None), None);
    }
}
