use ahash::HashSet;
use ahash::HashSetExt;

/// Capabilities advertised by a built index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IndexFeature {
  Build,
  BuildWithMultiThread,
  AddAfterBuild,
  KnnSearch,
  RangeSearch,
  KnnSearchWithFilter,
  RangeSearchWithFilter,
  ConcurrentSearch,
  SerializeBytes,
  SerializeStream,
  DeserializeBytes,
  DeserializeStream,
  EstimateMemory,
  CalDistanceById,
  NeedTrain,
  MetricL2,
  MetricInnerProduct,
  MetricCosine,
}

#[derive(Debug, Default)]
pub struct FeatureList {
  set: HashSet<IndexFeature>,
}

impl FeatureList {
  pub fn new() -> Self {
    Self {
      set: HashSet::new(),
    }
  }

  pub fn set_feature(&mut self, feature: IndexFeature) {
    self.set.insert(feature);
  }

  pub fn set_features(&mut self, features: &[IndexFeature]) {
    for &f in features {
      self.set.insert(f);
    }
  }

  pub fn check(&self, feature: IndexFeature) -> bool {
    self.set.contains(&feature)
  }
}
