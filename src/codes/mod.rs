use crate::cfg::CodesCfg;
use crate::cfg::QuantizerKind;
use crate::error::Result;
use crate::io::StreamReader;
use crate::io::StreamWriter;
use crate::metric::Metric;
use crate::InnerId;

mod flat;
mod sq8;

pub use flat::FlatCodes;
pub use sq8::Sq8Codes;

/// Vector codes keyed by dense inner id. The index treats stores as black
/// boxes: train on raw vectors, insert batches, answer distances. A store
/// may quantize; the precise/base pairing drives the reorder stage.
pub trait CodeStore: Send + Sync {
  fn dim(&self) -> usize;
  fn metric(&self) -> Metric;
  /// Bytes per stored vector, for memory estimation.
  fn code_size(&self) -> usize;
  fn total_count(&self) -> usize;
  fn in_memory(&self) -> bool {
    true
  }
  fn needs_train(&self) -> bool;
  fn train(&self, vectors: &[f32]) -> Result<()>;
  /// Appends `vectors.len() / dim` rows after any already stored.
  fn batch_insert(&self, vectors: &[f32]) -> Result<()>;
  /// Pre-reserves storage for `capacity` rows.
  fn reserve(&self, capacity: usize);
  /// Prepares a query for repeated scoring against stored codes.
  fn scorer<'a>(&'a self, query: &'a [f32]) -> Box<dyn QueryScorer + 'a>;
  /// Distance between two stored rows (used by pruning).
  fn dist_between(&self, a: InnerId, b: InnerId) -> f32;
  fn save(&self, w: &mut StreamWriter) -> Result<()>;
  fn load(&self, r: &mut StreamReader) -> Result<()>;
}

/// Prepared-query view over a store; one per traversal, single-threaded.
pub trait QueryScorer {
  fn score(&self, id: InnerId) -> f32;
  fn score_batch(&self, ids: &[InnerId], out: &mut [f32]);
  /// Advisory cache hint; never changes results.
  fn prefetch(&self, _id: InnerId) {}
}

pub fn make_code_store(cfg: &CodesCfg, dim: usize, metric: Metric) -> Box<dyn CodeStore> {
  match cfg.quantizer {
    QuantizerKind::Fp32 => Box::new(FlatCodes::new(dim, metric)),
    QuantizerKind::Sq8 => Box::new(Sq8Codes::new(dim, metric)),
  }
}
