//! Stage 3: Skip Completion.
//!
//! Grounded on §4.H Stage 3: a skipped subflow's surrogate id is already
//! mapped in its parent's map, so every node inside it is given that same
//! source node with an execution count taken from the user loop
//! annotation. A skipped subflow without an annotation is fatal — the
//! binary loop ran, but nothing tells the output writer how many times.

use crate::graph::NodeId;
use crate::matching::{ExecCount, GraphMap, HierarchicalGraphMap, MappingError};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct LoopAnnotation {
    pub repeats: u64,
    /// Authoritative cycle count for the whole skipped subflow. When
    /// present it overrides the `repeats * block_time` product the output
    /// writer would otherwise compute (see [`GraphMap::set_cycle_override`]).
    pub time: Option<u64>,
    /// Sanity-check fields: the user's expected source line / binary
    /// address for the skipped loop head, checked against DWARF by the
    /// caller before completion runs (see `Analysis::run_mapping`).
    pub line: Option<u32>,
    pub addr: Option<u64>,
}

/// Completes every `skip = true` node of `hgm`, recursing into children.
/// `annotations` is keyed by the binary loop header id.
pub fn complete_skips(
    hgm: &mut HierarchicalGraphMap,
    parent_map: Option<&GraphMap>,
    subflow_nodes: &HashMap<NodeId, Vec<NodeId>>,
    annotations: &HashMap<NodeId, LoopAnnotation>,
) -> Result<(), MappingError> {
    if hgm.skip {
        let surrogate = hgm.loop_id_bin.ok_or_else(|| {
            MappingError::HierarchyMismatch("skipped subflow has no parent surrogate id".into())
        })?;
        let parent = parent_map.ok_or_else(|| {
            MappingError::HierarchyMismatch("skipped subflow has no parent map to inherit from".into())
        })?;
        let src = parent.get(surrogate).ok_or(MappingError::MissingAnnotation(surrogate))?;
        let annotation = annotations.get(&surrogate).ok_or(MappingError::MissingAnnotation(surrogate))?;

        let mut members = subflow_nodes.get(&surrogate).cloned().unwrap_or_default();
        members.sort_by_key(|n| n.as_u32());
        for &m in &members {
            if !hgm.map.is_mapped(m) {
                hgm.map.insert(m, src);
            }
        }
        let count = ExecCount { lo: 0, hi: annotation.repeats };
        for &m in &members {
            hgm.map.set_exec_count(m, count);
        }
        // `time`, when given, is the authoritative cycle total for the whole
        // subflow and overrides the repeats-derived product. Attributed to
        // the lowest-id member only so the output writer's per-bin-BB sum
        // doesn't multiply it by the member count.
        if let Some(time) = annotation.time {
            if let Some(&head) = members.first() {
                hgm.map.set_cycle_override(head, time);
            }
        }
    }

    let self_map = hgm.map.clone();
    for child in &mut hgm.children {
        complete_skips(child, Some(&self_map), subflow_nodes, annotations)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_loop_inherits_parents_source_node_and_repeat_count() {
        let mut parent = GraphMap::new();
        parent.insert(NodeId(50), NodeId(5)); // surrogate 50 already maps to src 5

        let mut child_map = GraphMap::new();
        let mut hgm = HierarchicalGraphMap {
            loop_id_bin: Some(NodeId(50)),
            loop_id_src: None,
            map: std::mem::take(&mut child_map),
            skip: true,
            children: Vec::new(),
        };

        let mut subflow_nodes = HashMap::new();
        subflow_nodes.insert(NodeId(50), vec![NodeId(1), NodeId(2)]);
        let mut annotations = HashMap::new();
        annotations.insert(NodeId(50), LoopAnnotation { repeats: 7, time: None, line: None, addr: None });

        complete_skips(&mut hgm, Some(&parent), &subflow_nodes, &annotations).unwrap();
        assert_eq!(hgm.map.get(NodeId(1)), Some(NodeId(5)));
        assert_eq!(hgm.map.exec_count(NodeId(1)), Some(ExecCount { lo: 0, hi: 7 }));
    }

    #[test]
    fn authoritative_time_overrides_repeats_on_the_head_member() {
        let mut parent = GraphMap::new();
        parent.insert(NodeId(50), NodeId(5));

        let mut hgm = HierarchicalGraphMap { loop_id_bin: Some(NodeId(50)), loop_id_src: None, map: GraphMap::new(), skip: true, children: Vec::new() };

        let mut subflow_nodes = HashMap::new();
        subflow_nodes.insert(NodeId(50), vec![NodeId(2), NodeId(1)]);
        let mut annotations = HashMap::new();
        annotations.insert(NodeId(50), LoopAnnotation { repeats: 7, time: Some(500), line: None, addr: None });

        complete_skips(&mut hgm, Some(&parent), &subflow_nodes, &annotations).unwrap();
        assert_eq!(hgm.map.cycle_override(NodeId(1)), Some(500));
        assert_eq!(hgm.map.cycle_override(NodeId(2)), None);
    }

    #[test]
    fn missing_annotation_is_fatal() {
        let parent = GraphMap::new();
        let mut hgm = HierarchicalGraphMap { loop_id_bin: Some(NodeId(50)), loop_id_src: None, map: GraphMap::new(), skip: true, children: Vec::new() };
        let subflow_nodes = HashMap::new();
        let annotations = HashMap::new();
        let result = complete_skips(&mut hgm, Some(&parent), &subflow_nodes, &annotations);
        assert!(result.is_err());
    }
}
