//! Thread reconstruction from stored parent pointers.
//!
//! Input is every stored row of one thread; output is the display order: a
//! pre-order walk from the roots where siblings are ordered by date. This is
//! the order obtained by sorting on each message's ancestor date path
//! (root date, …, parent date, own date), except that a subtree always stays
//! contiguous even when two ancestors share a timestamp.
//!
//! Ordering depends only on parent pointers, dates and message ids, never on
//! the order rows were inserted or returned. Parent pointers that leave the
//! row set, or that close a cycle, are treated as broken: the message becomes
//! a root and the edge is reported.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::warn;

/// One stored message of a thread, as read from the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub message_id: String,
    pub date: DateTime<Utc>,
    pub subject: String,
    pub from: String,
    pub has_attachment: bool,
}

/// One message in display order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MessageNode {
    pub id: i64,
    /// Parent in the reconstructed tree; `None` for roots, including
    /// messages whose stored parent edge was broken.
    pub parent_id: Option<i64>,
    /// Hops from the nearest root.
    pub depth: usize,
    pub message_id: String,
    pub date: DateTime<Utc>,
    pub subject: String,
    pub from: String,
    pub has_attachment: bool,
}

/// Why a stored parent edge was not followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EdgeFault {
    /// The parent is not part of this thread's rows.
    Dangling,
    /// Following the edge would loop.
    Cycle,
}

/// A stored parent pointer that reconstruction ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BrokenEdge {
    pub child: i64,
    pub parent: i64,
    pub fault: EdgeFault,
}

/// Result of [`reconstruct`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Reconstruction {
    pub nodes: Vec<MessageNode>,
    pub broken_edges: Vec<BrokenEdge>,
}

/// Rebuild the display order of one thread.
///
/// Every row appears exactly once in the output, whatever the shape of the
/// parent pointers.
pub fn reconstruct(rows: &[ThreadRow]) -> Reconstruction {
    let index: HashMap<i64, usize> = rows.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
    let key = |i: usize| (rows[i].date, rows[i].message_id.as_str(), rows[i].id);

    let mut broken_edges = Vec::new();
    let mut parent: Vec<Option<usize>> = vec![None; rows.len()];
    for (i, row) in rows.iter().enumerate() {
        let Some(pid) = row.parent_id else { continue };
        match index.get(&pid) {
            Some(&p) if p != i => parent[i] = Some(p),
            Some(_) => broken_edges.push(BrokenEdge {
                child: row.id,
                parent: pid,
                fault: EdgeFault::Cycle,
            }),
            None => broken_edges.push(BrokenEdge {
                child: row.id,
                parent: pid,
                fault: EdgeFault::Dangling,
            }),
        }
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); rows.len()];
    for (i, p) in parent.iter().enumerate() {
        if let Some(p) = p {
            children[*p].push(i);
        }
    }

    // Anything not reachable from a root hangs off a cycle: cut each cycle at
    // its earliest member until every row is reachable.
    let mut roots: Vec<usize> = (0..rows.len()).filter(|&i| parent[i].is_none()).collect();
    let mut reached = vec![false; rows.len()];
    mark_reachable(&roots, &children, &mut reached);

    while let Some(start) = (0..rows.len()).filter(|&i| !reached[i]).min_by_key(|&i| key(i)) {
        let cycle = find_cycle(start, &parent);
        let Some(&cut) = cycle.iter().min_by_key(|&&i| key(i)) else {
            break;
        };
        let Some(old_parent) = parent[cut].take() else {
            break;
        };
        children[old_parent].retain(|&c| c != cut);
        warn!(
            message_id = %rows[cut].message_id,
            parent = rows[old_parent].id,
            "Breaking parent cycle in thread"
        );
        broken_edges.push(BrokenEdge {
            child: rows[cut].id,
            parent: rows[old_parent].id,
            fault: EdgeFault::Cycle,
        });
        roots.push(cut);
        mark_reachable(&[cut], &children, &mut reached);
    }

    roots.sort_by_key(|&i| key(i));
    for list in &mut children {
        list.sort_by_key(|&i| key(i));
    }

    // Iterative pre-order walk; children pushed in reverse so the earliest pops first
    let mut nodes = Vec::with_capacity(rows.len());
    let mut stack: Vec<(usize, usize)> = roots.iter().rev().map(|&r| (r, 0)).collect();
    while let Some((i, depth)) = stack.pop() {
        let row = &rows[i];
        nodes.push(MessageNode {
            id: row.id,
            parent_id: parent[i].map(|p| rows[p].id),
            depth,
            message_id: row.message_id.clone(),
            date: row.date,
            subject: row.subject.clone(),
            from: row.from.clone(),
            has_attachment: row.has_attachment,
        });
        stack.extend(children[i].iter().rev().map(|&c| (c, depth + 1)));
    }

    Reconstruction {
        nodes,
        broken_edges,
    }
}

fn mark_reachable(from: &[usize], children: &[Vec<usize>], reached: &mut [bool]) {
    let mut stack: Vec<usize> = from.to_vec();
    while let Some(i) = stack.pop() {
        if std::mem::replace(&mut reached[i], true) {
            continue;
        }
        stack.extend(children[i].iter().copied().filter(|&c| !reached[c]));
    }
}

/// Walk up from `start` until a node repeats; return the members of that loop.
///
/// Only called for unreachable nodes, whose parent chains never end.
fn find_cycle(start: usize, parent: &[Option<usize>]) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut current = start;
    while seen.insert(current) {
        match parent[current] {
            Some(p) => current = p,
            None => return vec![current],
        }
    }

    let mut cycle = vec![current];
    let mut next = parent[current];
    while let Some(n) = next {
        if n == current {
            break;
        }
        cycle.push(n);
        next = parent[n];
    }
    cycle
}
