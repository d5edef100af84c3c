use parking_lot::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub type VisitTag = u16;

/// Generation-tagged visited tracker. A slot is visited iff `mass[i] == tag`.
#[derive(Debug)]
pub struct VisitedList {
  cur_v: VisitTag,
  pub mass: Vec<VisitTag>,
}

impl VisitedList {
  pub fn new(capacity: usize) -> Self {
    Self {
      cur_v: VisitTag::MAX,
      mass: vec![0; capacity],
    }
  }

  /// Advances the generation; zeroes the array on tag wraparound.
  pub fn reset(&mut self) -> VisitTag {
    self.cur_v = self.cur_v.wrapping_add(1);
    if self.cur_v == 0 {
      self.mass.fill(0);
      self.cur_v = 1;
    }
    self.cur_v
  }
}

/// Thread-safe pool of visited trackers sized to the index capacity.
/// Concurrent traversals receive disjoint trackers.
#[derive(Debug)]
pub struct VisitedPool {
  pool: Mutex<Vec<VisitedList>>,
  capacity: AtomicUsize,
}

impl VisitedPool {
  pub fn new(initial_pool_size: usize, capacity: usize) -> Self {
    let mut pool = Vec::with_capacity(initial_pool_size);
    for _ in 0..initial_pool_size {
      pool.push(VisitedList::new(capacity));
    }
    Self {
      pool: Mutex::new(pool),
      capacity: AtomicUsize::new(capacity),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity.load(Ordering::Acquire)
  }

  /// Grows the tracked capacity. Pooled trackers of the old size are
  /// discarded; callers must not hold handles across a resize.
  pub fn resize(&self, capacity: usize) {
    let mut pool = self.pool.lock();
    self.capacity.store(capacity, Ordering::Release);
    pool.clear();
  }

  pub fn get(&self) -> VisitedHandle<'_> {
    let capacity = self.capacity();
    let mut pool = self.pool.lock();
    let mut list = match pool.pop() {
      Some(list) if list.mass.len() == capacity => list,
      _ => VisitedList::new(capacity),
    };
    drop(pool);
    let tag = list.reset();
    VisitedHandle {
      pool: self,
      list: Some(list),
      tag,
    }
  }
}

pub struct VisitedHandle<'a> {
  pool: &'a VisitedPool,
  list: Option<VisitedList>,
  pub tag: VisitTag,
}

impl VisitedHandle<'_> {
  pub fn mass_mut(&mut self) -> &mut [VisitTag] {
    &mut self.list.as_mut().expect("list present until drop").mass
  }
}

impl Drop for VisitedHandle<'_> {
  fn drop(&mut self) {
    if let Some(list) = self.list.take() {
      if list.mass.len() == self.pool.capacity() {
        self.pool.pool.lock().push(list);
      }
    }
  }
}
