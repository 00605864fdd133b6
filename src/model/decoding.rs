//! Maximum spanning tree decoding of arc scores (Chu-Liu/Edmonds)
//!
//! Score matrices are indexed `[dependent][head]` over `n + 1` nodes where
//! node 0 is the artificial root.

const NEG_INF: f64 = f64::NEG_INFINITY;

fn argmax(row: &[f64]) -> usize {
    let mut best = 0;
    for (index, &value) in row.iter().enumerate() {
        if value > row[best] {
            best = index;
        }
    }
    best
}

fn find_cycle(tree: &[usize]) -> Option<Vec<usize>> {
    // 0 = unvisited, 1 = on current path, 2 = finished
    let mut state = vec![0u8; tree.len()];
    state[0] = 2;
    for start in 1..tree.len() {
        if state[start] != 0 {
            continue;
        }
        let mut path = Vec::new();
        let mut node = start;
        while state[node] == 0 {
            state[node] = 1;
            path.push(node);
            node = tree[node];
        }
        if state[node] == 1 {
            if let Some(pos) = path.iter().position(|&n| n == node) {
                return Some(path[pos..].to_vec());
            }
        }
        for &visited in &path {
            state[visited] = 2;
        }
    }
    None
}

/// Highest-scoring head assignment forming a tree rooted at node 0
///
/// Returns one head per node; entry 0 is the root's self-reference.
pub fn chu_liu_edmonds(scores: &[Vec<f64>]) -> Vec<usize> {
    let n = scores.len();
    let mut scores = scores.to_vec();
    for (d, row) in scores.iter_mut().enumerate() {
        row[d] = NEG_INF;
    }
    for h in 0..n {
        scores[0][h] = NEG_INF;
    }
    scores[0][0] = 0.0;

    let tree: Vec<usize> = scores.iter().map(|row| argmax(row)).collect();
    let Some(cycle) = find_cycle(&tree) else {
        return tree;
    };

    let mut in_cycle = vec![false; n];
    for &node in &cycle {
        in_cycle[node] = true;
    }
    let outside: Vec<usize> = (0..n).filter(|&node| !in_cycle[node]).collect();
    let cycle_score: f64 = cycle.iter().map(|&c| scores[c][tree[c]]).sum();

    // Best cycle node to break when entering the cycle from each outside head
    let entering: Vec<(usize, f64)> = outside
        .iter()
        .map(|&h| {
            cycle
                .iter()
                .map(|&c| (c, scores[c][h] - scores[c][tree[c]] + cycle_score))
                .fold((cycle[0], NEG_INF), |best, item| if item.1 > best.1 { item } else { best })
        })
        .collect();
    // Best cycle head for each outside dependent
    let leaving: Vec<(usize, f64)> = outside
        .iter()
        .map(|&d| {
            cycle
                .iter()
                .map(|&c| (c, scores[d][c]))
                .fold((cycle[0], NEG_INF), |best, item| if item.1 > best.1 { item } else { best })
        })
        .collect();

    let m = outside.len();
    let mut contracted = vec![vec![NEG_INF; m + 1]; m + 1];
    for (i, &d) in outside.iter().enumerate() {
        for (j, &h) in outside.iter().enumerate() {
            contracted[i][j] = scores[d][h];
        }
        contracted[i][m] = leaving[i].1;
        contracted[m][i] = entering[i].1;
    }

    let contracted_tree = chu_liu_edmonds(&contracted);

    let mut heads = tree.clone();
    for (i, &d) in outside.iter().enumerate().skip(1) {
        let h = contracted_tree[i];
        heads[d] = if h < m { outside[h] } else { leaving[i].0 };
    }
    let cycle_head = contracted_tree[m];
    heads[entering[cycle_head].0] = outside[cycle_head];
    heads
}

/// Sum of the chosen arc scores, root excluded
pub fn tree_score(scores: &[Vec<f64>], heads: &[usize]) -> f64 {
    heads
        .iter()
        .enumerate()
        .skip(1)
        .map(|(d, &h)| scores[d][h])
        .sum()
}

/// Best tree in which exactly one word attaches to the root
///
/// `scores` is `(n + 1) x (n + 1)`; the result holds the heads of words
/// `1..=n`.
pub fn decode_single_root(scores: &[Vec<f64>]) -> Vec<usize> {
    let n = scores.len();
    if n <= 1 {
        return Vec::new();
    }

    let heads = chu_liu_edmonds(scores);
    if heads.iter().skip(1).filter(|&&h| h == 0).count() == 1 {
        return heads[1..].to_vec();
    }

    let mut best: Option<(f64, Vec<usize>)> = None;
    for root_child in 1..n {
        if scores[root_child][0] == NEG_INF {
            continue;
        }
        let mut constrained = scores.to_vec();
        for (d, row) in constrained.iter_mut().enumerate().skip(1) {
            if d != root_child {
                row[0] = NEG_INF;
            }
        }
        let candidate = chu_liu_edmonds(&constrained);
        let score = tree_score(scores, &candidate);
        if best.as_ref().map_or(true, |(b, _)| score > *b) {
            best = Some((score, candidate));
        }
    }

    match best {
        Some((_, heads)) => heads[1..].to_vec(),
        None => heads[1..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn is_single_root_tree(heads: &[usize]) -> bool {
        let n = heads.len();
        if heads.iter().filter(|&&h| h == 0).count() != 1 {
            return false;
        }
        for start in 1..=n {
            let mut node = start;
            let mut steps = 0;
            while node != 0 {
                node = heads[node - 1];
                steps += 1;
                if steps > n || node > n {
                    return false;
                }
            }
        }
        true
    }

    fn brute_force(scores: &[Vec<f64>]) -> f64 {
        let n = scores.len() - 1;
        let mut best = NEG_INF;
        let total = (n + 1).pow(n as u32);
        for code in 0..total {
            let mut heads = Vec::with_capacity(n);
            let mut rest = code;
            for _ in 0..n {
                heads.push(rest % (n + 1));
                rest /= n + 1;
            }
            if heads.iter().enumerate().any(|(i, &h)| h == i + 1) || !is_single_root_tree(&heads) {
                continue;
            }
            let score: f64 = heads.iter().enumerate().map(|(i, &h)| scores[i + 1][h]).sum();
            best = best.max(score);
        }
        best
    }

    #[test]
    fn test_breaks_cycle() {
        // words 1 and 2 prefer each other; the root prefers word 1
        let scores = vec![
            vec![0.0, 0.0, 0.0],
            vec![5.0, NEG_INF, 10.0],
            vec![1.0, 10.0, NEG_INF],
        ];
        let heads = decode_single_root(&scores);
        assert_eq!(heads, vec![0, 1]);
    }

    #[test]
    fn test_single_root_enforced() {
        let scores = vec![
            vec![0.0, 0.0, 0.0, 0.0],
            vec![9.0, NEG_INF, 1.0, 1.0],
            vec![9.0, 1.0, NEG_INF, 1.0],
            vec![8.0, 2.0, 1.0, NEG_INF],
        ];
        let heads = decode_single_root(&scores);
        assert!(is_single_root_tree(&heads));
        assert_eq!(heads.iter().filter(|&&h| h == 0).count(), 1);
    }

    #[test]
    fn test_empty_sentence() {
        assert!(decode_single_root(&[vec![0.0]]).is_empty());
    }

    proptest! {
        #[test]
        fn prop_matches_brute_force(n in 1usize..5, seed in prop::collection::vec(-5.0f64..5.0, 25)) {
            let scores: Vec<Vec<f64>> = (0..=n)
                .map(|d| (0..=n).map(|h| if d == h { NEG_INF } else { seed[d * 5 + h] }).collect())
                .collect();
            let heads = decode_single_root(&scores);
            prop_assert_eq!(heads.len(), n);
            prop_assert!(is_single_root_tree(&heads));

            let mut full = vec![0];
            full.extend(&heads);
            let score = tree_score(&scores, &full);
            prop_assert!((score - brute_force(&scores)).abs() < 1e-9);
        }
    }
}
