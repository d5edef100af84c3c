use crate::error::Error;
use crate::error::Result;
use crate::io::StreamReader;
use crate::io::StreamWriter;
use crate::InnerId;
use ahash::HashMap;
use ahash::HashMapExt;
use parking_lot::RwLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// A directed neighbor list per node, capped at `max_degree`.
///
/// Implementations publish a list atomically: readers observe either the
/// previous complete list or the new complete list, never a partial write.
/// Callers serialize writers per node through `PointLocks`.
pub trait GraphLayer: Send + Sync {
  fn max_degree(&self) -> usize;
  fn total_count(&self) -> usize;
  fn increase_total_count(&self, n: usize);
  /// Copies the neighbors of `id` into `out` (cleared first).
  fn get_neighbors(&self, id: InnerId, out: &mut Vec<InnerId>);
  /// Stores `neighbors` as the list of `id`. Idempotent overwrite.
  fn insert_neighbors(&self, id: InnerId, neighbors: &[InnerId]);
  fn in_memory(&self) -> bool {
    true
  }
}

/// Bottom layer: neighbor lists stored contiguously, keyed by dense id.
/// Per node: one header word holding the list length, then `max_degree`
/// neighbor words. Header is written last with Release so a loaded length
/// always covers fully written neighbor words.
#[derive(Debug)]
pub struct DenseGraph {
  max_degree: usize,
  links: Vec<AtomicU32>,
  total: AtomicUsize,
}

impl DenseGraph {
  pub fn new(max_degree: usize, capacity: usize) -> Self {
    let words = capacity * (1 + max_degree);
    let mut links = Vec::with_capacity(words);
    links.resize_with(words, || AtomicU32::new(0));
    Self {
      max_degree,
      links,
      total: AtomicUsize::new(0),
    }
  }

  pub fn capacity(&self) -> usize {
    self.links.len() / (1 + self.max_degree)
  }

  /// Grows the backing storage; existing slots are preserved.
  pub fn resize(&mut self, capacity: usize) {
    let words = capacity * (1 + self.max_degree);
    if words > self.links.len() {
      self.links.resize_with(words, || AtomicU32::new(0));
    }
  }

  fn block(&self, id: InnerId) -> &[AtomicU32] {
    let words = 1 + self.max_degree;
    let start = id as usize * words;
    &self.links[start..start + words]
  }

  pub fn save(&self, w: &mut StreamWriter) -> Result<()> {
    let total = self.total_count();
    w.write_u32(self.max_degree as u32)?;
    w.write_u64(total as u64)?;
    let mut list = Vec::with_capacity(self.max_degree);
    for id in 0..total {
      self.get_neighbors(id as InnerId, &mut list);
      w.write_u32(list.len() as u32)?;
      w.write_u32_slice(&list)?;
    }
    Ok(())
  }

  pub fn load(&mut self, r: &mut StreamReader) -> Result<()> {
    let max_degree = r.read_u32()? as usize;
    if max_degree != self.max_degree {
      return Err(Error::ReadError(format!(
        "bottom graph degree mismatch: stored {max_degree}, configured {}",
        self.max_degree
      )));
    }
    let total = r.read_u64()? as usize;
    if total > self.capacity() {
      return Err(Error::ReadError(format!(
        "bottom graph count {total} exceeds capacity {}",
        self.capacity()
      )));
    }
    for id in 0..total {
      let len = r.read_u32()? as usize;
      if len > self.max_degree {
        return Err(Error::ReadError(format!("neighbor list too long: {len}")));
      }
      let ids = r.read_u32_vec(len)?;
      self.insert_neighbors(id as InnerId, &ids);
    }
    self.total.store(total, Ordering::Release);
    Ok(())
  }
}

impl GraphLayer for DenseGraph {
  fn max_degree(&self) -> usize {
    self.max_degree
  }

  fn total_count(&self) -> usize {
    self.total.load(Ordering::Acquire)
  }

  fn increase_total_count(&self, n: usize) {
    self.total.fetch_add(n, Ordering::AcqRel);
  }

  fn get_neighbors(&self, id: InnerId, out: &mut Vec<InnerId>) {
    out.clear();
    let block = self.block(id);
    let len = (block[0].load(Ordering::Acquire) as usize).min(self.max_degree);
    for word in &block[1..1 + len] {
      out.push(word.load(Ordering::Relaxed));
    }
  }

  fn insert_neighbors(&self, id: InnerId, neighbors: &[InnerId]) {
    debug_assert!(neighbors.len() <= self.max_degree);
    let block = self.block(id);
    for (word, &n) in block[1..].iter().zip(neighbors.iter()) {
      word.store(n, Ordering::Relaxed);
    }
    block[0].store(neighbors.len() as u32, Ordering::Release);
  }
}

/// Route layer: only promoted ids carry a list, so a hash-keyed map beats
/// a dense arena at the expected density of `mult * ln(N)` nodes.
#[derive(Debug)]
pub struct SparseGraph {
  max_degree: usize,
  map: RwLock<HashMap<InnerId, Vec<InnerId>>>,
  total: AtomicUsize,
}

impl SparseGraph {
  pub fn new(max_degree: usize) -> Self {
    Self {
      max_degree,
      map: RwLock::new(HashMap::new()),
      total: AtomicUsize::new(0),
    }
  }

  /// Ids present on this layer, unordered.
  pub fn keys(&self) -> Vec<InnerId> {
    self.map.read().keys().copied().collect()
  }

  pub fn save(&self, w: &mut StreamWriter) -> Result<()> {
    w.write_u32(self.max_degree as u32)?;
    w.write_u64(self.total_count() as u64)?;
    let map = self.map.read();
    w.write_u64(map.len() as u64)?;
    // Sorted for byte-stable output.
    let mut ids: Vec<InnerId> = map.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
      let list = &map[&id];
      w.write_u32(id)?;
      w.write_u32(list.len() as u32)?;
      w.write_u32_slice(list)?;
    }
    Ok(())
  }

  pub fn load(&self, r: &mut StreamReader) -> Result<()> {
    let max_degree = r.read_u32()? as usize;
    if max_degree != self.max_degree {
      return Err(Error::ReadError(format!(
        "route graph degree mismatch: stored {max_degree}, configured {}",
        self.max_degree
      )));
    }
    let total = r.read_u64()? as usize;
    let entries = r.read_u64()? as usize;
    let mut map = self.map.write();
    map.reserve(entries);
    for _ in 0..entries {
      let id = r.read_u32()?;
      let len = r.read_u32()? as usize;
      if len > self.max_degree {
        return Err(Error::ReadError(format!("neighbor list too long: {len}")));
      }
      map.insert(id, r.read_u32_vec(len)?);
    }
    self.total.store(total, Ordering::Release);
    Ok(())
  }
}

impl GraphLayer for SparseGraph {
  fn max_degree(&self) -> usize {
    self.max_degree
  }

  fn total_count(&self) -> usize {
    self.total.load(Ordering::Acquire)
  }

  fn increase_total_count(&self, n: usize) {
    self.total.fetch_add(n, Ordering::AcqRel);
  }

  fn get_neighbors(&self, id: InnerId, out: &mut Vec<InnerId>) {
    out.clear();
    if let Some(list) = self.map.read().get(&id) {
      out.extend_from_slice(list);
    }
  }

  fn insert_neighbors(&self, id: InnerId, neighbors: &[InnerId]) {
    debug_assert!(neighbors.len() <= self.max_degree);
    self.map.write().insert(id, neighbors.to_vec());
  }
}
