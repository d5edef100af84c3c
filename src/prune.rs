use crate::codes::CodeStore;
use crate::error::Error;
use crate::error::Result;
use crate::graph::GraphLayer;
use crate::locks::PointLocks;
use crate::searcher::DistHeap;
use crate::InnerId;
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

/// Diversity-preserving neighbor selection. Keeps a candidate only if the
/// anchor is closer to it than every already-kept neighbor, walking
/// candidates in ascending distance order. Heaps smaller than `m` are kept
/// as-is.
pub fn select_edges(candidates: &mut DistHeap, m: usize, codes: &dyn CodeStore) {
  if candidates.len() < m {
    return;
  }

  let mut queue_closest: BinaryHeap<(OrderedFloat<f32>, InnerId)> = BinaryHeap::new();
  while let Some((dist, id)) = candidates.pop() {
    queue_closest.push((OrderedFloat(-dist.0), id));
  }

  let mut kept: Vec<(f32, InnerId)> = Vec::with_capacity(m);
  while let Some((neg_dist, cand)) = queue_closest.pop() {
    if kept.len() >= m {
      break;
    }
    let dist_to_anchor = -neg_dist.0;
    let diverse = kept
      .iter()
      .all(|&(_, sel)| codes.dist_between(sel, cand) >= dist_to_anchor);
    if diverse {
      kept.push((dist_to_anchor, cand));
    }
  }

  for (dist, id) in kept {
    candidates.push((OrderedFloat(dist), id));
  }
}

/// Installs the pruned candidate set as the neighbors of `inner_id` and
/// back-links `inner_id` into each selected neighbor, re-pruning any list
/// that would exceed the degree cap. Returns the closest selected id, the
/// entry point for the next layer down.
///
/// Lock discipline: exclusive per-node locks are taken one at a time and
/// never nested.
pub fn mutually_connect(
  inner_id: InnerId,
  mut candidates: DistHeap,
  graph: &dyn GraphLayer,
  codes: &dyn CodeStore,
  locks: &PointLocks,
) -> Result<InnerId> {
  let m = graph.max_degree();
  select_edges(&mut candidates, m, codes);
  if candidates.len() > m {
    return Err(Error::Internal(format!(
      "pruning kept {} candidates, cap is {m}",
      candidates.len()
    )));
  }

  let mut selected: Vec<(f32, InnerId)> = Vec::with_capacity(candidates.len());
  while let Some((dist, id)) = candidates.pop() {
    selected.push((dist.0, id));
  }
  selected.reverse(); // ascending distance
  let closest = selected
    .first()
    .map(|&(_, id)| id)
    .ok_or_else(|| Error::Internal("empty neighbor selection".to_string()))?;

  let ids: Vec<InnerId> = selected.iter().map(|&(_, id)| id).collect();
  {
    let _guard = locks.exclusive(inner_id);
    graph.insert_neighbors(inner_id, &ids);
  }

  let mut existing: Vec<InnerId> = Vec::with_capacity(m + 1);
  for &neighbor in &ids {
    debug_assert_ne!(neighbor, inner_id);
    let _guard = locks.exclusive(neighbor);
    graph.get_neighbors(neighbor, &mut existing);
    if existing.iter().any(|&e| e == inner_id) {
      continue;
    }
    if existing.len() < m {
      existing.push(inner_id);
      graph.insert_neighbors(neighbor, &existing);
      continue;
    }

    // Full list: re-run the selection over existing ∪ {inner_id}, with
    // distances taken to this neighbor.
    let mut heap: DistHeap = BinaryHeap::new();
    heap.push((OrderedFloat(codes.dist_between(inner_id, neighbor)), inner_id));
    for &e in &existing {
      heap.push((OrderedFloat(codes.dist_between(e, neighbor)), e));
    }
    select_edges(&mut heap, m, codes);
    let mut pruned: Vec<(f32, InnerId)> = Vec::with_capacity(heap.len());
    while let Some((dist, id)) = heap.pop() {
      pruned.push((dist.0, id));
    }
    pruned.reverse();
    let pruned_ids: Vec<InnerId> = pruned.iter().map(|&(_, id)| id).collect();
    graph.insert_neighbors(neighbor, &pruned_ids);
  }

  Ok(closest)
}
