use crate::InnerId;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;

const MAX_SHARDS: usize = 1 << 16;
const MIN_SHARDS: usize = 1 << 6;

/// Reader-writer lock per node, bucketed mod a power-of-two shard count.
/// Lock `id` covers the neighbor lists of node `id` on every layer.
/// Exclusive acquisitions are never nested by callers, so bucket
/// collisions cannot deadlock.
#[derive(Debug)]
pub struct PointLocks {
  shards: Box<[RwLock<()>]>,
  mask: usize,
}

impl PointLocks {
  pub fn new(capacity: usize) -> Self {
    let n = capacity
      .next_power_of_two()
      .clamp(MIN_SHARDS, MAX_SHARDS);
    let mut shards = Vec::with_capacity(n);
    shards.resize_with(n, || RwLock::new(()));
    Self {
      shards: shards.into_boxed_slice(),
      mask: n - 1,
    }
  }

  pub fn shard_count(&self) -> usize {
    self.shards.len()
  }

  pub fn shared(&self, id: InnerId) -> RwLockReadGuard<'_, ()> {
    self.shards[id as usize & self.mask].read()
  }

  pub fn exclusive(&self, id: InnerId) -> RwLockWriteGuard<'_, ()> {
    self.shards[id as usize & self.mask].write()
  }
}
