use crate::error::Error;
use crate::error::Result;
use serde::Deserialize;
use serde::Serialize;

fn default_ef_construction() -> usize {
  400
}

fn default_build_thread_count() -> usize {
  1
}

fn default_max_degree() -> usize {
  32
}

fn default_max_capacity() -> usize {
  1024
}

fn default_ef_search() -> usize {
  60
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuantizerKind {
  #[default]
  Fp32,
  Sq8,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CodesCfg {
  #[serde(default)]
  pub quantizer: QuantizerKind,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GraphCfg {
  #[serde(default = "default_max_degree")]
  pub max_degree: usize,
  #[serde(default = "default_max_capacity")]
  pub max_capacity: usize,
}

impl Default for GraphCfg {
  fn default() -> Self {
    Self {
      max_degree: default_max_degree(),
      max_capacity: default_max_capacity(),
    }
  }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
pub struct ExtraInfoCfg {
  #[serde(default)]
  pub extra_info_size: usize,
}

/// Build-time options. All fields carry defaults so a partial JSON document
/// configures only what it names.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IndexCfg {
  #[serde(default)]
  pub use_reorder: bool,
  #[serde(default = "default_ef_construction")]
  pub ef_construction: usize,
  #[serde(default = "default_build_thread_count")]
  pub build_thread_count: usize,
  #[serde(default)]
  pub base_codes_param: CodesCfg,
  #[serde(default)]
  pub precise_codes_param: CodesCfg,
  #[serde(default)]
  pub bottom_graph_param: GraphCfg,
  #[serde(default)]
  pub extra_info_param: ExtraInfoCfg,
}

impl Default for IndexCfg {
  fn default() -> Self {
    Self {
      use_reorder: false,
      ef_construction: default_ef_construction(),
      build_thread_count: default_build_thread_count(),
      base_codes_param: CodesCfg::default(),
      precise_codes_param: CodesCfg::default(),
      bottom_graph_param: GraphCfg::default(),
      extra_info_param: ExtraInfoCfg::default(),
    }
  }
}

impl IndexCfg {
  pub fn from_json(json: &str) -> Result<Self> {
    let cfg: IndexCfg = serde_json::from_str(json)
      .map_err(|e| Error::InvalidArgument(format!("bad build parameters: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> Result<()> {
    if self.ef_construction == 0 {
      return Err(Error::InvalidArgument(
        "ef_construction must be positive".to_string(),
      ));
    }
    if self.build_thread_count == 0 {
      return Err(Error::InvalidArgument(
        "build_thread_count must be positive".to_string(),
      ));
    }
    if self.bottom_graph_param.max_degree < 2 {
      return Err(Error::InvalidArgument(
        "max_degree must be at least 2".to_string(),
      ));
    }
    Ok(())
  }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
struct GraphSearchSection {
  #[serde(default = "default_ef_search")]
  ef_search: usize,
}

impl Default for GraphSearchSection {
  fn default() -> Self {
    Self {
      ef_search: default_ef_search(),
    }
  }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default)]
struct SearchDocument {
  #[serde(default)]
  hgraph: GraphSearchSection,
}

/// Per-query options parsed from `{"hgraph": {"ef_search": N}}`.
#[derive(Clone, Copy, Debug)]
pub struct SearchCfg {
  pub ef_search: usize,
}

impl SearchCfg {
  pub fn from_json(json: &str) -> Result<Self> {
    let doc: SearchDocument = serde_json::from_str(json)
      .map_err(|e| Error::InvalidArgument(format!("bad search parameters: {e}")))?;
    if doc.hgraph.ef_search == 0 {
      return Err(Error::InvalidArgument(
        "ef_search must be positive".to_string(),
      ));
    }
    Ok(Self {
      ef_search: doc.hgraph.ef_search,
    })
  }
}
