use crate::codes::CodeStore;
use crate::codes::QueryScorer;
use crate::error::Error;
use crate::error::Result;
use crate::io::StreamReader;
use crate::io::StreamWriter;
use crate::metric::prefetch_read;
use crate::metric::DistanceFn;
use crate::metric::Metric;
use crate::InnerId;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use std::mem::size_of;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Full-precision f32 codes in one contiguous arena. No training needed.
#[derive(Debug)]
pub struct FlatCodes {
  dim: usize,
  metric: Metric,
  dist_fn: DistanceFn,
  data: RwLock<Vec<f32>>,
  total: AtomicUsize,
}

impl FlatCodes {
  pub fn new(dim: usize, metric: Metric) -> Self {
    Self {
      dim,
      metric,
      dist_fn: metric.distance_fn(),
      data: RwLock::new(Vec::new()),
      total: AtomicUsize::new(0),
    }
  }
}

impl CodeStore for FlatCodes {
  fn dim(&self) -> usize {
    self.dim
  }

  fn metric(&self) -> Metric {
    self.metric
  }

  fn code_size(&self) -> usize {
    self.dim * size_of::<f32>()
  }

  fn total_count(&self) -> usize {
    self.total.load(Ordering::Acquire)
  }

  fn needs_train(&self) -> bool {
    false
  }

  fn train(&self, _vectors: &[f32]) -> Result<()> {
    Ok(())
  }

  fn batch_insert(&self, vectors: &[f32]) -> Result<()> {
    if self.dim == 0 || vectors.len() % self.dim != 0 {
      return Err(Error::InvalidArgument(format!(
        "vector data length {} is not a multiple of dim {}",
        vectors.len(),
        self.dim
      )));
    }
    let rows = vectors.len() / self.dim;
    let mut data = self.data.write();
    data.extend_from_slice(vectors);
    drop(data);
    self.total.fetch_add(rows, Ordering::AcqRel);
    Ok(())
  }

  fn reserve(&self, capacity: usize) {
    let mut data = self.data.write();
    let want = capacity * self.dim;
    let len = data.len();
    if want > len {
      data.reserve(want - len);
    }
  }

  fn scorer<'a>(&'a self, query: &'a [f32]) -> Box<dyn QueryScorer + 'a> {
    Box::new(FlatScorer {
      data: self.data.read(),
      query,
      dim: self.dim,
      dist_fn: self.dist_fn,
    })
  }

  fn dist_between(&self, a: InnerId, b: InnerId) -> f32 {
    let data = self.data.read();
    let a = &data[a as usize * self.dim..(a as usize + 1) * self.dim];
    let b = &data[b as usize * self.dim..(b as usize + 1) * self.dim];
    unsafe { (self.dist_fn)(a.as_ptr(), b.as_ptr(), self.dim) }
  }

  fn save(&self, w: &mut StreamWriter) -> Result<()> {
    let data = self.data.read();
    let total = self.total_count();
    w.write_u64(total as u64)?;
    w.write_f32_slice(&data[..total * self.dim])
  }

  fn load(&self, r: &mut StreamReader) -> Result<()> {
    let total = r.read_u64()? as usize;
    let vals = r.read_f32_vec(total * self.dim)?;
    *self.data.write() = vals;
    self.total.store(total, Ordering::Release);
    Ok(())
  }
}

struct FlatScorer<'a> {
  data: RwLockReadGuard<'a, Vec<f32>>,
  query: &'a [f32],
  dim: usize,
  dist_fn: DistanceFn,
}

impl QueryScorer for FlatScorer<'_> {
  fn score(&self, id: InnerId) -> f32 {
    let row = &self.data[id as usize * self.dim..(id as usize + 1) * self.dim];
    unsafe { (self.dist_fn)(self.query.as_ptr(), row.as_ptr(), self.dim) }
  }

  fn score_batch(&self, ids: &[InnerId], out: &mut [f32]) {
    for (i, &id) in ids.iter().enumerate() {
      if i + 1 < ids.len() {
        self.prefetch(ids[i + 1]);
      }
      out[i] = self.score(id);
    }
  }

  fn prefetch(&self, id: InnerId) {
    let start = id as usize * self.dim;
    if start < self.data.len() {
      prefetch_read(self.data[start..].as_ptr() as *const u8);
    }
  }
}
