use crate::codes::CodeStore;
use crate::codes::QueryScorer;
use crate::error::Error;
use crate::error::Result;
use crate::io::StreamReader;
use crate::io::StreamWriter;
use crate::metric::prefetch_read;
use crate::metric::Metric;
use crate::InnerId;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Per-dimension affine bounds fitted on the first training batch.
#[derive(Debug, Clone)]
struct Sq8Bounds {
  lower: Vec<f32>,
  diff: Vec<f32>,
}

/// Scalar-quantized codes: one u8 per dimension, decoded on the fly while
/// scoring. Training fixes the bounds; later batches reuse them so stored
/// codes stay valid.
#[derive(Debug)]
pub struct Sq8Codes {
  dim: usize,
  metric: Metric,
  bounds: RwLock<Option<Sq8Bounds>>,
  codes: RwLock<Vec<u8>>,
  total: AtomicUsize,
}

impl Sq8Codes {
  pub fn new(dim: usize, metric: Metric) -> Self {
    Self {
      dim,
      metric,
      bounds: RwLock::new(None),
      codes: RwLock::new(Vec::new()),
      total: AtomicUsize::new(0),
    }
  }

  fn encode_into(&self, bounds: &Sq8Bounds, row: &[f32], out: &mut Vec<u8>) {
    for (i, &v) in row.iter().enumerate() {
      let diff = bounds.diff[i];
      let code = if diff > 0.0 {
        (((v - bounds.lower[i]) / diff) * 255.0).round().clamp(0.0, 255.0) as u8
      } else {
        0
      };
      out.push(code);
    }
  }
}

#[inline]
fn decode(bounds: &Sq8Bounds, i: usize, code: u8) -> f32 {
  bounds.lower[i] + (code as f32 / 255.0) * bounds.diff[i]
}

fn score_row(metric: Metric, bounds: &Sq8Bounds, query: &[f32], row: &[u8]) -> f32 {
  match metric {
    Metric::L2 => {
      let mut acc = 0.0_f32;
      for (i, &c) in row.iter().enumerate() {
        let d = query[i] - decode(bounds, i, c);
        acc += d * d;
      }
      acc
    }
    Metric::InnerProduct | Metric::Cosine => {
      let mut dot = 0.0_f32;
      for (i, &c) in row.iter().enumerate() {
        dot += query[i] * decode(bounds, i, c);
      }
      1.0 - dot
    }
  }
}

impl CodeStore for Sq8Codes {
  fn dim(&self) -> usize {
    self.dim
  }

  fn metric(&self) -> Metric {
    self.metric
  }

  fn code_size(&self) -> usize {
    self.dim
  }

  fn total_count(&self) -> usize {
    self.total.load(Ordering::Acquire)
  }

  fn needs_train(&self) -> bool {
    true
  }

  fn train(&self, vectors: &[f32]) -> Result<()> {
    if vectors.is_empty() {
      return Ok(());
    }
    if vectors.len() % self.dim != 0 {
      return Err(Error::InvalidArgument(format!(
        "training data length {} is not a multiple of dim {}",
        vectors.len(),
        self.dim
      )));
    }
    let mut bounds = self.bounds.write();
    if bounds.is_some() {
      return Ok(());
    }
    let mut lower = vec![f32::INFINITY; self.dim];
    let mut upper = vec![f32::NEG_INFINITY; self.dim];
    for row in vectors.chunks_exact(self.dim) {
      for (i, &v) in row.iter().enumerate() {
        lower[i] = lower[i].min(v);
        upper[i] = upper[i].max(v);
      }
    }
    let diff = lower.iter().zip(upper.iter()).map(|(l, u)| u - l).collect();
    *bounds = Some(Sq8Bounds { lower, diff });
    Ok(())
  }

  fn batch_insert(&self, vectors: &[f32]) -> Result<()> {
    if vectors.len() % self.dim != 0 {
      return Err(Error::InvalidArgument(format!(
        "vector data length {} is not a multiple of dim {}",
        vectors.len(),
        self.dim
      )));
    }
    let bounds = self.bounds.read();
    let bounds = bounds
      .as_ref()
      .ok_or_else(|| Error::Internal("scalar quantizer used before training".to_string()))?;
    let rows = vectors.len() / self.dim;
    let mut codes = self.codes.write();
    codes.reserve(rows * self.dim);
    for row in vectors.chunks_exact(self.dim) {
      self.encode_into(bounds, row, &mut codes);
    }
    drop(codes);
    self.total.fetch_add(rows, Ordering::AcqRel);
    Ok(())
  }

  fn reserve(&self, capacity: usize) {
    let mut codes = self.codes.write();
    let want = capacity * self.dim;
    let len = codes.len();
    if want > len {
      codes.reserve(want - len);
    }
  }

  fn scorer<'a>(&'a self, query: &'a [f32]) -> Box<dyn QueryScorer + 'a> {
    Box::new(Sq8Scorer {
      codes: self.codes.read(),
      bounds: self.bounds.read(),
      query,
      dim: self.dim,
      metric: self.metric,
    })
  }

  fn dist_between(&self, a: InnerId, b: InnerId) -> f32 {
    let codes = self.codes.read();
    let bounds = self.bounds.read();
    let bounds = bounds.as_ref().expect("trained before graph construction");
    let a = &codes[a as usize * self.dim..(a as usize + 1) * self.dim];
    let b = &codes[b as usize * self.dim..(b as usize + 1) * self.dim];
    match self.metric {
      Metric::L2 => {
        let mut acc = 0.0_f32;
        for i in 0..self.dim {
          let d = decode(bounds, i, a[i]) - decode(bounds, i, b[i]);
          acc += d * d;
        }
        acc
      }
      Metric::InnerProduct | Metric::Cosine => {
        let mut dot = 0.0_f32;
        for i in 0..self.dim {
          dot += decode(bounds, i, a[i]) * decode(bounds, i, b[i]);
        }
        1.0 - dot
      }
    }
  }

  fn save(&self, w: &mut StreamWriter) -> Result<()> {
    let bounds = self.bounds.read();
    let codes = self.codes.read();
    let total = self.total_count();
    match bounds.as_ref() {
      Some(b) => {
        w.write_u8(1)?;
        w.write_f32_slice(&b.lower)?;
        w.write_f32_slice(&b.diff)?;
      }
      None => w.write_u8(0)?,
    }
    w.write_u64(total as u64)?;
    w.write_bytes(&codes[..total * self.dim])
  }

  fn load(&self, r: &mut StreamReader) -> Result<()> {
    let trained = r.read_u8()?;
    if trained == 1 {
      let lower = r.read_f32_vec(self.dim)?;
      let diff = r.read_f32_vec(self.dim)?;
      *self.bounds.write() = Some(Sq8Bounds { lower, diff });
    } else if trained != 0 {
      return Err(Error::ReadError(format!("bad quantizer flag {trained}")));
    }
    let total = r.read_u64()? as usize;
    *self.codes.write() = r.read_bytes(total * self.dim)?;
    self.total.store(total, Ordering::Release);
    Ok(())
  }
}

struct Sq8Scorer<'a> {
  codes: RwLockReadGuard<'a, Vec<u8>>,
  bounds: RwLockReadGuard<'a, Option<Sq8Bounds>>,
  query: &'a [f32],
  dim: usize,
  metric: Metric,
}

impl QueryScorer for Sq8Scorer<'_> {
  fn score(&self, id: InnerId) -> f32 {
    let bounds = self.bounds.as_ref().expect("trained before scoring");
    let row = &self.codes[id as usize * self.dim..(id as usize + 1) * self.dim];
    score_row(self.metric, bounds, self.query, row)
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
    if start < self.codes.len() {
      prefetch_read(self.codes[start..].as_ptr());
    }
  }
}
