//! Граф traversal алгоритмы
//!
//! Обход поверх произвольной функции соседей: движок передаёт сюда
//! `neighbors` по снимку, тесты - обычный HashMap.

use std::collections::{HashSet, VecDeque};

use crate::error::{GraphError, Result};
use crate::storage::CancelToken;

fn check(cancel: Option<&CancelToken>) -> Result<()> {
    if cancel.map_or(false, |c| c.is_cancelled()) {
        return Err(GraphError::Cancelled);
    }
    Ok(())
}

/// BFS traversal от start нод
///
/// Returns nodes in visit order, start nodes first. The token is checked
/// before each expansion.
pub fn bfs<F>(
    start: &[u128],
    max_depth: usize,
    cancel: Option<&CancelToken>,
    mut get_neighbors: F,
) -> Result<Vec<u128>>
where
    F: FnMut(u128) -> Result<Vec<u128>>,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from_iter(start.iter().copied());
    let mut result = Vec::new();
    let mut depth = 0;

    while !queue.is_empty() && depth <= max_depth {
        let level_size = queue.len();

        for _ in 0..level_size {
            let Some(node) = queue.pop_front() else {
                break;
            };
            if !visited.insert(node) {
                continue;
            }
            result.push(node);

            // последний уровень не раскрываем
            if depth == max_depth {
                continue;
            }
            check(cancel)?;
            for neighbor in get_neighbors(node)? {
                if !visited.contains(&neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }

        depth += 1;
    }

    Ok(result)
}

/// DFS traversal (для обратной трассировки)
pub fn dfs<F>(
    start: &[u128],
    max_depth: usize,
    cancel: Option<&CancelToken>,
    mut get_neighbors: F,
) -> Result<Vec<u128>>
where
    F: FnMut(u128) -> Result<Vec<u128>>,
{
    let mut visited = HashSet::new();
    let mut stack = Vec::from_iter(start.iter().rev().map(|&id| (id, 0)));
    let mut result = Vec::new();

    while let Some((node, depth)) = stack.pop() {
        if depth > max_depth || !visited.insert(node) {
            continue;
        }
        result.push(node);

        if depth == max_depth {
            continue;
        }
        check(cancel)?;
        for neighbor in get_neighbors(node)? {
            if !visited.contains(&neighbor) {
                stack.push((neighbor, depth + 1));
            }
        }
    }

    Ok(result)
}

/// Is `target` reachable from any of `start` within `max_depth` hops?
/// Stops expanding as soon as the target is seen.
pub fn reachable<F>(
    start: &[u128],
    target: u128,
    max_depth: usize,
    cancel: Option<&CancelToken>,
    mut get_neighbors: F,
) -> Result<bool>
where
    F: FnMut(u128) -> Result<Vec<u128>>,
{
    if start.contains(&target) {
        return Ok(true);
    }
    let mut visited: HashSet<u128> = start.iter().copied().collect();
    let mut frontier: Vec<u128> = start.to_vec();

    for _ in 0..max_depth {
        let mut next = Vec::new();
        for node in frontier {
            check(cancel)?;
            for neighbor in get_neighbors(node)? {
                if neighbor == target {
                    return Ok(true);
                }
                if visited.insert(neighbor) {
                    next.push(neighbor);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    Ok(false)
}
