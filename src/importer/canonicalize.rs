//! Canonicalize pass: collapse the correlation graph into per-range facts
//!
//! Three closures run here, each with an explicit worklist rather than a
//! pointer graph:
//!
//! 1. linked reference results are unioned (union-find over the `item
//!    property=referenceResults` pairs) and their member lists merged;
//! 2. moniker groups linked by `nextMoniker` are flattened so every member
//!    carries the whole group;
//! 3. `next` chains from ranges through result sets are walked (memoized)
//!    to fill each range's effective definition, reference, hover, and
//!    moniker attachments — the nearest value along the chain wins.

use super::correlator::{Correlator, RawMember, RawMoniker, ResultAttachments, VertexId};
use crate::models::{PackageInformationData, Range};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct CanonicalRange {
    pub range: Range,
    pub definition_result: Option<VertexId>,
    pub reference_result: Option<VertexId>,
    pub hover_result: Option<VertexId>,
    pub monikers: Vec<VertexId>,
}

#[derive(Debug)]
pub struct Canonicalized {
    pub lsif_version: String,
    pub documents: HashMap<VertexId, String>,
    pub contains: HashMap<VertexId, Vec<VertexId>>,
    pub ranges: HashMap<VertexId, CanonicalRange>,
    pub definition_results: HashMap<VertexId, Vec<RawMember>>,
    pub reference_results: HashMap<VertexId, Vec<RawMember>>,
    pub hover_results: HashMap<VertexId, String>,
    pub monikers: HashMap<VertexId, RawMoniker>,
    pub package_information: HashMap<VertexId, PackageInformationData>,
    /// Monikers observed on the ranges and result sets feeding each
    /// canonical result; the source of the moniker-indexed rows.
    pub result_monikers: HashMap<VertexId, BTreeSet<VertexId>>,
}

/// Plain union-find over interned vertex ids.
struct UnionFind {
    parent: HashMap<VertexId, VertexId>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: HashMap::new(),
        }
    }

    fn find(&mut self, id: VertexId) -> VertexId {
        let mut root = id;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        // Path compression.
        let mut current = id;
        while let Some(&parent) = self.parent.get(&current) {
            if parent == root {
                break;
            }
            self.parent.insert(current, root);
            current = parent;
        }
        root
    }

    fn union(&mut self, a: VertexId, b: VertexId) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            // Deterministic canonical representative: the smaller id.
            let (keep, merge) = if root_a < root_b {
                (root_a, root_b)
            } else {
                (root_b, root_a)
            };
            self.parent.insert(merge, keep);
        }
    }
}

pub fn canonicalize(correlator: Correlator) -> Canonicalized {
    let Correlator {
        lsif_version,
        documents,
        contains,
        ranges,
        result_sets,
        definition_results,
        mut reference_results,
        hover_results,
        monikers,
        package_information,
        moniker_links,
        linked_reference_results,
        ..
    } = correlator;

    // 1. Merge linked reference results.
    let mut reference_union = UnionFind::new();
    for &(a, b) in &linked_reference_results {
        reference_union.union(a, b);
    }
    let reference_ids: Vec<VertexId> = reference_results.keys().copied().collect();
    let mut merged_references: HashMap<VertexId, Vec<RawMember>> = HashMap::new();
    for id in reference_ids {
        let canonical = reference_union.find(id);
        let members = reference_results.remove(&id).unwrap_or_default();
        merged_references.entry(canonical).or_default().extend(members);
    }
    for members in merged_references.values_mut() {
        members.sort();
        members.dedup();
    }

    // 2. Flatten moniker groups.
    let mut moniker_union = UnionFind::new();
    for &(a, b) in &moniker_links {
        moniker_union.union(a, b);
    }
    let mut moniker_groups: HashMap<VertexId, BTreeSet<VertexId>> = HashMap::new();
    for &id in monikers.keys() {
        moniker_groups
            .entry(moniker_union.find(id))
            .or_default()
            .insert(id);
    }
    let expand_monikers = |attached: &[VertexId]| -> Vec<VertexId> {
        let mut expanded = BTreeSet::new();
        for &id in attached {
            let root = {
                // find() needs &mut; groups were precomputed instead.
                let mut walk = id;
                loop {
                    match moniker_union.parent.get(&walk) {
                        Some(&parent) if parent != walk => walk = parent,
                        _ => break walk,
                    }
                }
            };
            match moniker_groups.get(&root) {
                Some(group) => expanded.extend(group.iter().copied()),
                None => {
                    expanded.insert(id);
                }
            }
        }
        expanded.into_iter().collect()
    };

    // 3. Resolve `next` chains, memoizing per result set.
    let mut resolved_sets: HashMap<VertexId, ResultAttachments> = HashMap::new();
    for &set_id in result_sets.keys() {
        resolve_set(set_id, &result_sets, &mut resolved_sets);
    }

    let mut canonical_ranges = HashMap::new();
    let mut result_monikers: HashMap<VertexId, BTreeSet<VertexId>> = HashMap::new();
    for (range_id, raw) in &ranges {
        let mut effective = raw.attachments.clone();
        if let Some(next) = effective.next {
            if let Some(set) = resolved_sets.get(&next) {
                merge_attachments(&mut effective, set);
            }
        }

        let definition_result = effective.definition_result;
        let reference_result = effective
            .reference_result
            .map(|id| reference_union.find(id));
        let monikers_on_range = expand_monikers(&effective.monikers);

        for result in [definition_result, reference_result].into_iter().flatten() {
            result_monikers
                .entry(result)
                .or_default()
                .extend(monikers_on_range.iter().copied());
        }

        canonical_ranges.insert(
            *range_id,
            CanonicalRange {
                range: raw.range,
                definition_result,
                reference_result,
                hover_result: effective.hover_result,
                monikers: monikers_on_range,
            },
        );
    }

    Canonicalized {
        lsif_version: lsif_version.expect("validated by the correlator"),
        documents,
        contains,
        ranges: canonical_ranges,
        definition_results,
        reference_results: merged_references,
        hover_results,
        monikers,
        package_information,
        result_monikers,
    }
}

/// Resolve a result set's effective attachments by walking its own `next`
/// chain. Memoized; cycles (malformed but non-fatal) terminate at the
/// first repeated node.
fn resolve_set(
    set_id: VertexId,
    result_sets: &HashMap<VertexId, ResultAttachments>,
    resolved: &mut HashMap<VertexId, ResultAttachments>,
) -> ResultAttachments {
    if let Some(done) = resolved.get(&set_id) {
        return done.clone();
    }

    let mut effective = match result_sets.get(&set_id) {
        Some(attachments) => attachments.clone(),
        None => ResultAttachments::default(),
    };

    let mut visited = HashSet::from([set_id]);
    let mut cursor = effective.next;
    while let Some(next_id) = cursor {
        if !visited.insert(next_id) {
            break;
        }
        if let Some(done) = resolved.get(&next_id) {
            merge_attachments(&mut effective, done);
            break;
        }
        let Some(next) = result_sets.get(&next_id) else {
            break;
        };
        merge_attachments(&mut effective, next);
        cursor = next.next;
    }

    resolved.insert(set_id, effective.clone());
    effective
}

/// Fold `outer` into `target`: existing (nearer) values win, monikers
/// accumulate.
fn merge_attachments(target: &mut ResultAttachments, outer: &ResultAttachments) {
    if target.definition_result.is_none() {
        target.definition_result = outer.definition_result;
    }
    if target.reference_result.is_none() {
        target.reference_result = outer.reference_result;
    }
    if target.hover_result.is_none() {
        target.hover_result = outer.hover_result;
    }
    target.monikers.extend(outer.monikers.iter().copied());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::elements::parse_line;
    use crate::importer::ImportError;

    fn canonicalize_lines(lines: &[&str]) -> Result<Canonicalized, ImportError> {
        let mut correlator = Correlator::new();
        for (index, line) in lines.iter().enumerate() {
            let number = index as u64 + 1;
            correlator.insert(parse_line(line, number)?, number)?;
        }
        Ok(canonicalize(correlator.finish()?))
    }

    #[test]
    fn test_next_chain_resolution() {
        let state = canonicalize_lines(&[
            r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3"}"#,
            r#"{"id":2,"type":"vertex","label":"document","uri":"a.ts"}"#,
            r#"{"id":3,"type":"vertex","label":"range","start":{"line":0,"character":0},"end":{"line":0,"character":3}}"#,
            r#"{"id":4,"type":"vertex","label":"resultSet"}"#,
            r#"{"id":5,"type":"vertex","label":"resultSet"}"#,
            r#"{"id":6,"type":"edge","label":"next","outV":3,"inV":4}"#,
            r#"{"id":7,"type":"edge","label":"next","outV":4,"inV":5}"#,
            r#"{"id":8,"type":"vertex","label":"definitionResult"}"#,
            r#"{"id":9,"type":"edge","label":"textDocument/definition","outV":5,"inV":8}"#,
            r#"{"id":10,"type":"edge","label":"contains","outV":2,"inVs":[3]}"#,
            r#"{"id":11,"type":"edge","label":"item","outV":8,"inVs":[3],"document":2}"#,
        ])
        .unwrap();

        // The range inherits the definition result from two hops away.
        let range = state.ranges.values().next().unwrap();
        assert!(range.definition_result.is_some());
    }

    #[test]
    fn test_nearer_attachment_wins() {
        let state = canonicalize_lines(&[
            r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3"}"#,
            r#"{"id":2,"type":"vertex","label":"document","uri":"a.ts"}"#,
            r#"{"id":3,"type":"vertex","label":"range","start":{"line":0,"character":0},"end":{"line":0,"character":3}}"#,
            r#"{"id":4,"type":"vertex","label":"resultSet"}"#,
            r#"{"id":5,"type":"edge","label":"next","outV":3,"inV":4}"#,
            r#"{"id":6,"type":"vertex","label":"hoverResult","result":{"contents":"outer"}}"#,
            r#"{"id":7,"type":"vertex","label":"hoverResult","result":{"contents":"inner"}}"#,
            r#"{"id":8,"type":"edge","label":"textDocument/hover","outV":4,"inV":6}"#,
            r#"{"id":9,"type":"edge","label":"textDocument/hover","outV":3,"inV":7}"#,
            r#"{"id":10,"type":"edge","label":"contains","outV":2,"inVs":[3]}"#,
        ])
        .unwrap();

        let range = state.ranges.values().next().unwrap();
        let hover = state.hover_results[&range.hover_result.unwrap()].clone();
        assert_eq!(hover, "inner");
    }

    #[test]
    fn test_linked_reference_results_merge() {
        let state = canonicalize_lines(&[
            r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3"}"#,
            r#"{"id":2,"type":"vertex","label":"document","uri":"a.ts"}"#,
            r#"{"id":3,"type":"vertex","label":"range","start":{"line":0,"character":0},"end":{"line":0,"character":1}}"#,
            r#"{"id":4,"type":"vertex","label":"range","start":{"line":1,"character":0},"end":{"line":1,"character":1}}"#,
            r#"{"id":5,"type":"edge","label":"contains","outV":2,"inVs":[3,4]}"#,
            r#"{"id":6,"type":"vertex","label":"referenceResult"}"#,
            r#"{"id":7,"type":"vertex","label":"referenceResult"}"#,
            r#"{"id":8,"type":"edge","label":"textDocument/references","outV":3,"inV":6}"#,
            r#"{"id":9,"type":"edge","label":"textDocument/references","outV":4,"inV":7}"#,
            r#"{"id":10,"type":"edge","label":"item","outV":6,"inVs":[3],"document":2,"property":"references"}"#,
            r#"{"id":11,"type":"edge","label":"item","outV":7,"inVs":[4],"document":2,"property":"references"}"#,
            r#"{"id":12,"type":"edge","label":"item","outV":6,"inVs":[7],"document":2,"property":"referenceResults"}"#,
        ])
        .unwrap();

        // Both reference results collapsed into one with both members, and
        // both ranges point at the canonical id.
        assert_eq!(state.reference_results.len(), 1);
        let members = state.reference_results.values().next().unwrap();
        assert_eq!(members.len(), 2);
        let canonical: Vec<_> = state
            .ranges
            .values()
            .map(|r| r.reference_result.unwrap())
            .collect();
        assert_eq!(canonical[0], canonical[1]);
    }

    #[test]
    fn test_moniker_groups_flatten() {
        let state = canonicalize_lines(&[
            r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3"}"#,
            r#"{"id":2,"type":"vertex","label":"document","uri":"a.ts"}"#,
            r#"{"id":3,"type":"vertex","label":"range","start":{"line":0,"character":0},"end":{"line":0,"character":1}}"#,
            r#"{"id":4,"type":"edge","label":"contains","outV":2,"inVs":[3]}"#,
            r#"{"id":5,"type":"vertex","label":"moniker","kind":"local","scheme":"tsc","identifier":"a"}"#,
            r#"{"id":6,"type":"vertex","label":"moniker","kind":"export","scheme":"npm","identifier":"lib:a"}"#,
            r#"{"id":7,"type":"edge","label":"nextMoniker","outV":5,"inV":6}"#,
            r#"{"id":8,"type":"edge","label":"moniker","outV":3,"inV":5}"#,
        ])
        .unwrap();

        let range = state.ranges.values().next().unwrap();
        assert_eq!(range.monikers.len(), 2);
    }
}
