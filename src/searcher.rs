use crate::codes::QueryScorer;
use crate::graph::GraphLayer;
use crate::locks::PointLocks;
use crate::visited::VisitedPool;
use crate::InnerId;
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

/// Max-heap of (distance, id); the closest entry is the one left after
/// popping down to size one.
pub type DistHeap = BinaryHeap<(OrderedFloat<f32>, InnerId)>;

/// Slack applied to the radius cut so borderline float error does not drop
/// genuine in-range points.
pub const RADIUS_EPSILON: f32 = 2e-6;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SearchMode {
  Knn,
  Range,
}

pub struct InnerSearchParams<'a> {
  pub entry_point: InnerId,
  pub ef: usize,
  pub mode: SearchMode,
  /// Only read in Range mode.
  pub radius: f32,
  /// Inner-id predicate; gates results, never traversal.
  pub filter: Option<&'a (dyn Fn(InnerId) -> bool + 'a)>,
}

fn allowed(filter: Option<&(dyn Fn(InnerId) -> bool + '_)>, id: InnerId) -> bool {
  filter.map(|f| f(id)).unwrap_or(true)
}

/// Best-first traversal over one graph layer.
///
/// `candidate_set` is a min-heap (negated keys) of frontier nodes;
/// `cur_result` is a max-heap bounded by `ef` in KNN mode. Each id is
/// relaxed at most once per traversal thanks to the generation-tagged
/// visited tracker, so the loop terminates after O(|visited| * degree)
/// distance computations.
pub fn beam_search(
  graph: &dyn GraphLayer,
  scorer: &dyn QueryScorer,
  locks: &PointLocks,
  visited_pool: &VisitedPool,
  params: &InnerSearchParams,
) -> DistHeap {
  let mut visited = visited_pool.get();
  let tag = visited.tag;
  let mass = visited.mass_mut();

  let mut candidate_set: DistHeap = BinaryHeap::new();
  let mut cur_result: DistHeap = BinaryHeap::new();

  let ep = params.entry_point;
  let ef = params.ef;

  let dist = scorer.score(ep);
  let mut lower_bound = f32::INFINITY;
  if allowed(params.filter, ep) {
    cur_result.push((OrderedFloat(dist), ep));
    lower_bound = dist;
  }
  if params.mode == SearchMode::Range && dist > params.radius && !cur_result.is_empty() {
    cur_result.pop();
  }
  candidate_set.push((OrderedFloat(-dist), ep));
  mass[ep as usize] = tag;

  let mut neighbors: Vec<InnerId> = Vec::with_capacity(graph.max_degree());
  let mut to_be_visited: Vec<InnerId> = Vec::with_capacity(graph.max_degree());
  let mut dists: Vec<f32> = vec![0.0; graph.max_degree()];

  while let Some(&(neg_dist, node)) = candidate_set.peek() {
    if params.mode == SearchMode::Knn && -neg_dist.0 > lower_bound && cur_result.len() == ef {
      break;
    }
    candidate_set.pop();

    {
      let _guard = locks.shared(node);
      graph.get_neighbors(node, &mut neighbors);
    }
    if let Some(&first) = neighbors.first() {
      scorer.prefetch(first);
    }

    to_be_visited.clear();
    for &n in &neighbors {
      if mass[n as usize] != tag {
        mass[n as usize] = tag;
        to_be_visited.push(n);
      }
    }

    let fresh = to_be_visited.len();
    scorer.score_batch(&to_be_visited, &mut dists[..fresh]);

    for i in 0..fresh {
      let d = dists[i];
      let id = to_be_visited[i];
      let in_range = params.mode == SearchMode::Range && d <= params.radius;
      if cur_result.len() < ef || lower_bound > d || in_range {
        candidate_set.push((OrderedFloat(-d), id));
        if let Some(&(_, next)) = candidate_set.peek() {
          scorer.prefetch(next);
        }

        if allowed(params.filter, id) {
          cur_result.push((OrderedFloat(d), id));
        }
        if params.mode == SearchMode::Knn {
          while cur_result.len() > ef {
            cur_result.pop();
          }
        }
        if let Some(&(worst, _)) = cur_result.peek() {
          lower_bound = worst.0;
        }
      }
    }
  }

  if params.mode == SearchMode::Range {
    while let Some(&(top, _)) = cur_result.peek() {
      if top.0 > params.radius + RADIUS_EPSILON {
        cur_result.pop();
      } else {
        break;
      }
    }
  }

  cur_result
}
