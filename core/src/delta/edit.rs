//! Keyed list diffing via longest-increasing-subsequence anchoring.
//!
//! Child items whose keys exist in the parent nominate (child, parent)
//! index pairs; the LIS over the parent indices picks the largest set of
//! pairs whose relative order agrees in both lists. Everything between
//! anchors becomes Del/Ins runs.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    Keep,
    Del,
    Ins,
}

impl EditOp {
    pub fn code(self) -> u8 {
        match self {
            EditOp::Keep => 0,
            EditOp::Del => 1,
            EditOp::Ins => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => EditOp::Keep,
            1 => EditOp::Del,
            2 => EditOp::Ins,
            other => return Err(Error::Format(format!("unknown edit op {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditRun {
    pub op: EditOp,
    pub len: usize,
}

/// A parent-to-child transformation: coalesced op runs plus the inserted
/// payloads in child order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditScript<T> {
    pub runs: Vec<EditRun>,
    pub inserts: Vec<T>,
    pub final_count: usize,
}

impl<T> EditScript<T> {
    pub fn is_identity(&self) -> bool {
        self.inserts.is_empty() && self.runs.iter().all(|r| r.op == EditOp::Keep)
    }

    pub fn kept(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.op == EditOp::Keep)
            .map(|r| r.len)
            .sum()
    }

    /// `(parent index, child index)` of every kept item, in order.
    pub fn kept_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        let mut pi = 0usize;
        let mut ci = 0usize;
        for run in &self.runs {
            match run.op {
                EditOp::Keep => {
                    for k in 0..run.len {
                        pairs.push((pi + k, ci + k));
                    }
                    pi += run.len;
                    ci += run.len;
                }
                EditOp::Del => pi += run.len,
                EditOp::Ins => ci += run.len,
            }
        }
        pairs
    }
}

/// Longest strictly-increasing subsequence by patience sorting; returns
/// the positions of the chosen elements.
fn longest_increasing_subsequence(seq: &[usize]) -> Vec<usize> {
    if seq.is_empty() {
        return Vec::new();
    }
    // tails[k] = position in seq of the smallest tail of any increasing
    // subsequence of length k+1; back[i] links each element to its
    // predecessor in the subsequence it extends.
    let mut tails: Vec<usize> = Vec::new();
    let mut back: Vec<Option<usize>> = vec![None; seq.len()];
    for (pos, &value) in seq.iter().enumerate() {
        let slot = tails.partition_point(|&t| seq[t] < value);
        if slot > 0 {
            back[pos] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(pos);
        } else {
            tails[slot] = pos;
        }
    }
    let mut chain = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(pos) = cursor {
        chain.push(pos);
        cursor = back[pos];
    }
    chain.reverse();
    chain
}

fn push_run(runs: &mut Vec<EditRun>, op: EditOp, len: usize) {
    if len == 0 {
        return;
    }
    if let Some(last) = runs.last_mut() {
        if last.op == op {
            last.len += len;
            return;
        }
    }
    runs.push(EditRun { op, len });
}

/// Diff `parent` against `child` with caller-supplied key and payload
/// extractors. Keys are expected unique per list; on duplicates the first
/// occurrence wins.
pub fn compute<P, C, K, T>(
    parent: &[P],
    child: &[C],
    parent_key: impl Fn(&P) -> K,
    child_key: impl Fn(&C) -> K,
    insert_payload: impl Fn(&C) -> T,
) -> EditScript<T>
where
    K: Eq + Hash,
{
    let mut parent_index: HashMap<K, usize> = HashMap::with_capacity(parent.len());
    for (i, item) in parent.iter().enumerate() {
        parent_index.entry(parent_key(item)).or_insert(i);
    }

    // (child position, parent position) for every matched key.
    let matches: Vec<(usize, usize)> = child
        .iter()
        .enumerate()
        .filter_map(|(ci, item)| parent_index.get(&child_key(item)).map(|&pi| (ci, pi)))
        .collect();
    let parent_positions: Vec<usize> = matches.iter().map(|&(_, pi)| pi).collect();
    let anchors: Vec<(usize, usize)> = longest_increasing_subsequence(&parent_positions)
        .into_iter()
        .map(|i| matches[i])
        .collect();

    let mut runs = Vec::new();
    let mut inserts = Vec::new();
    let mut pi = 0usize;
    let mut ci = 0usize;
    for (anchor_child, anchor_parent) in anchors {
        push_run(&mut runs, EditOp::Del, anchor_parent - pi);
        if anchor_child > ci {
            push_run(&mut runs, EditOp::Ins, anchor_child - ci);
            inserts.extend(child[ci..anchor_child].iter().map(&insert_payload));
        }
        push_run(&mut runs, EditOp::Keep, 1);
        pi = anchor_parent + 1;
        ci = anchor_child + 1;
    }
    push_run(&mut runs, EditOp::Del, parent.len() - pi);
    if ci < child.len() {
        push_run(&mut runs, EditOp::Ins, child.len() - ci);
        inserts.extend(child[ci..].iter().map(&insert_payload));
    }

    EditScript {
        runs,
        inserts,
        final_count: child.len(),
    }
}

/// Replay a script over `parent`, producing the child list.
pub fn apply<T: Clone>(script: &EditScript<T>, parent: &[T]) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(script.final_count);
    let mut pi = 0usize;
    let mut ins = 0usize;
    for run in &script.runs {
        match run.op {
            EditOp::Keep => {
                let end = pi + run.len;
                if end > parent.len() {
                    return Err(Error::Format(format!(
                        "edit script keeps {} past parent length {}",
                        end,
                        parent.len()
                    )));
                }
                out.extend(parent[pi..end].iter().cloned());
                pi = end;
            }
            EditOp::Del => {
                pi += run.len;
                if pi > parent.len() {
                    return Err(Error::Format("edit script deletes past parent end".into()));
                }
            }
            EditOp::Ins => {
                let end = ins + run.len;
                if end > script.inserts.len() {
                    return Err(Error::Format("edit script inserts more than supplied".into()));
                }
                out.extend(script.inserts[ins..end].iter().cloned());
                ins = end;
            }
        }
    }
    if pi != parent.len() {
        return Err(Error::Format(format!(
            "edit script consumed {pi} of {} parent items",
            parent.len()
        )));
    }
    if out.len() != script.final_count {
        return Err(Error::Format(format!(
            "edit script produced {} items, declared {}",
            out.len(),
            script.final_count
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_of(parent: &[&str], child: &[&str]) -> EditScript<String> {
        compute(
            parent,
            child,
            |p| p.to_string(),
            |c| c.to_string(),
            |c| c.to_string(),
        )
    }

    fn check_round_trip(parent: &[&str], child: &[&str]) {
        let script = script_of(parent, child);
        let parent_owned: Vec<String> = parent.iter().map(|s| s.to_string()).collect();
        let result = apply(&script, &parent_owned).unwrap();
        let child_owned: Vec<String> = child.iter().map(|s| s.to_string()).collect();
        assert_eq!(result, child_owned, "{parent:?} -> {child:?}");
    }

    #[test]
    fn apply_compute_is_child() {
        check_round_trip(&["a", "b", "c"], &["a", "b", "c"]);
        check_round_trip(&["a", "b", "c"], &["a", "x", "c"]);
        check_round_trip(&[], &["a", "b"]);
        check_round_trip(&["a", "b"], &[]);
        check_round_trip(&["a", "b", "c", "d"], &["d", "a", "b", "c"]);
        check_round_trip(&["a", "b", "c"], &["c", "b", "a"]);
        check_round_trip(&["x", "a", "y", "b"], &["a", "n", "b", "m"]);
    }

    #[test]
    fn identical_lists_are_single_keep_run() {
        let script = script_of(&["a", "b", "c"], &["a", "b", "c"]);
        assert_eq!(
            script.runs,
            vec![EditRun { op: EditOp::Keep, len: 3 }]
        );
        assert!(script.inserts.is_empty());
        assert!(script.is_identity());
    }

    #[test]
    fn keep_total_equals_lis_length() {
        // LIS of matched parent indices [2, 0, 1] is [0, 1] -> 2 keeps.
        let script = script_of(&["a", "b", "c"], &["c", "a", "b"]);
        assert_eq!(script.kept(), 2);
    }

    #[test]
    fn runs_are_coalesced() {
        let script = script_of(&["a", "b", "c", "d"], &["c", "d"]);
        assert_eq!(
            script.runs,
            vec![
                EditRun { op: EditOp::Del, len: 2 },
                EditRun { op: EditOp::Keep, len: 2 },
            ]
        );
    }

    #[test]
    fn lis_handles_plateaus_and_reversals() {
        assert_eq!(longest_increasing_subsequence(&[]), Vec::<usize>::new());
        assert_eq!(longest_increasing_subsequence(&[3, 2, 1]).len(), 1);
        assert_eq!(longest_increasing_subsequence(&[1, 2, 3]).len(), 3);
        let chosen = longest_increasing_subsequence(&[2, 5, 3, 7, 11, 8, 10, 13, 6]);
        assert_eq!(chosen.len(), 6);
    }

    #[test]
    fn malformed_script_is_rejected() {
        let script = EditScript::<String> {
            runs: vec![EditRun { op: EditOp::Keep, len: 2 }],
            inserts: vec![],
            final_count: 2,
        };
        assert!(apply(&script, &["only".to_string()]).is_err());
    }
}
