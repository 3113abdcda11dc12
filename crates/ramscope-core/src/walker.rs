//! # Kernel Structure Walker
//!
//! Corruption-tolerant traversal of circular kernel linked lists.
//!
//! The kernel's task lists are circular `list_head` rings embedded in
//! larger records. In a crash dump any link may be garbage, so the walk
//! treats the memory as untrusted: every node is validated before it is
//! emitted, a visited set guards against cycles that bypass the anchor,
//! and when the forward direction breaks, one bounded secondary pass runs
//! from the anchor over the `prev` links. The two passes share the visited
//! set so no node is emitted twice; if the secondary pass breaks too, the
//! outcome is flagged so the caller can say "entries may be missing"
//! instead of silently truncating.
//!
//! The walk is read-only, restartable, and produces identical output
//! across repeated runs on the same frozen image.

use std::collections::HashSet;

use tracing::warn;

use crate::debuginfo::ListOffsets;
use crate::mem::MemoryView;
use crate::types::VirtAddr;

/// Result of one traversal.
#[derive(Debug)]
pub struct WalkOutcome
{
    /// Node addresses in emission order, anchor first.
    pub nodes: Vec<VirtAddr>,
    /// True when the forward pass came back around to the anchor.
    pub complete: bool,
    /// Inline diagnostic when the list was found corrupt.
    pub corruption: Option<String>,
}

/// Walk a circular list embedded at `link_offset` inside each node.
///
/// `validate` decides whether a candidate node looks like the real thing;
/// the anchor itself is trusted and emitted first.
pub fn walk_circular<F>(
    mem: &MemoryView<'_>,
    anchor: VirtAddr,
    link_offset: u64,
    list: ListOffsets,
    validate: F,
) -> WalkOutcome
where
    F: Fn(VirtAddr) -> bool,
{
    let mut visited: HashSet<u64> = HashSet::new();
    let mut nodes = vec![anchor];
    visited.insert(anchor.value());

    let mut current = anchor;
    let failure = loop {
        let link = current + link_offset;
        let Some(next_ptr) = mem.read_pointer(link + list.next) else {
            break format!("unreadable forward link at {link}");
        };
        if next_ptr == VirtAddr::ZERO {
            break format!("null forward link at {link}");
        }
        let node = next_ptr - link_offset;
        if node == anchor {
            // Came back around; the ring is intact.
            return WalkOutcome {
                nodes,
                complete: true,
                corruption: None,
            };
        }
        if !visited.insert(node.value()) {
            break format!("cycle in list: {node} revisited before the anchor");
        }
        if !validate(node) {
            break format!("validation failed for {node}");
        }
        nodes.push(node);
        current = node;
    };

    warn!("forward walk from {anchor} broke: {failure}; retrying over back links");
    walk_backward(mem, anchor, link_offset, list, &validate, &mut visited, &mut nodes);

    WalkOutcome {
        nodes,
        complete: false,
        corruption: Some(failure),
    }
}

/// Secondary pass over the `prev` relation, sharing the forward pass's
/// visited set so overlapping nodes are not emitted twice.
fn walk_backward<F>(
    mem: &MemoryView<'_>,
    anchor: VirtAddr,
    link_offset: u64,
    list: ListOffsets,
    validate: &F,
    visited: &mut HashSet<u64>,
    nodes: &mut Vec<VirtAddr>,
) where
    F: Fn(VirtAddr) -> bool,
{
    let mut current = anchor;
    loop {
        let link = current + link_offset;
        let Some(prev_ptr) = mem.read_pointer(link + list.prev) else {
            return;
        };
        if prev_ptr == VirtAddr::ZERO {
            return;
        }
        let node = prev_ptr - link_offset;
        if node == anchor || !validate(node) {
            return;
        }
        if !visited.insert(node.value()) {
            // Reached territory the forward pass already covered.
            return;
        }
        nodes.push(node);
        current = node;
    }
}
