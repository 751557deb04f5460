//! Process tree enumeration from parent-pid linkage.

use std::collections::{HashMap, HashSet, VecDeque};

/// A descendant and its distance from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMember {
    pub pid: u32,
    pub depth: usize,
}

/// Every descendant of `root` given `(pid, ppid)` pairs. The root itself is
/// not included. Cycles in the linkage (pid reuse races) are cut.
pub fn descendants(root: u32, links: &[(u32, u32)]) -> Vec<TreeMember> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, ppid) in links {
        if pid != ppid {
            children.entry(*ppid).or_default().push(*pid);
        }
    }

    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([(root, 0usize)]);
    let mut members = Vec::new();

    while let Some((pid, depth)) = queue.pop_front() {
        for child in children.get(&pid).into_iter().flatten() {
            if seen.insert(*child) {
                members.push(TreeMember {
                    pid: *child,
                    depth: depth + 1,
                });
                queue.push_back((*child, depth + 1));
            }
        }
    }

    members
}

/// Kill order: deepest first, ascending pid within a depth.
pub fn kill_order(members: &[TreeMember]) -> Vec<u32> {
    let mut ordered = members.to_vec();
    ordered.sort_by(|a, b| b.depth.cmp(&a.depth).then(a.pid.cmp(&b.pid)));
    ordered.into_iter().map(|m| m.pid).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descendants_and_order() {
        // 100 -> 200, 300; 200 -> 250; 300 -> 310 -> 320
        let links = [
            (100, 1),
            (200, 100),
            (300, 100),
            (250, 200),
            (310, 300),
            (320, 310),
            (999, 1),
        ];
        let members = descendants(100, &links);
        assert_eq!(members.len(), 5);
        assert_eq!(kill_order(&members), vec![320, 250, 310, 200, 300]);
    }

    #[test]
    fn test_descendants_survive_cycles() {
        let links = [(10, 20), (20, 10), (30, 20)];
        let members = descendants(10, &links);
        let pids: Vec<u32> = members.iter().map(|m| m.pid).collect();
        assert_eq!(pids, vec![20, 30]);
    }

    #[test]
    fn test_leaf_has_no_descendants() {
        assert!(descendants(42, &[(42, 1), (43, 1)]).is_empty());
    }
}
