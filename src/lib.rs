pub mod cfg;
pub mod codes;
pub mod error;
pub mod extra;
pub mod features;
pub mod graph;
pub mod index;
pub mod io;
pub mod locks;
pub mod metric;
pub mod prune;
pub mod searcher;
pub mod visited;

pub use cfg::CodesCfg;
pub use cfg::ExtraInfoCfg;
pub use cfg::GraphCfg;
pub use cfg::IndexCfg;
pub use cfg::QuantizerKind;
pub use error::Error;
pub use error::Result;
pub use features::IndexFeature;
pub use index::block_size_limit;
pub use index::set_block_size_limit;
pub use index::Dataset;
pub use index::SearchOutput;
pub use index::StrataIndex;
pub use metric::Metric;

/// Dense internal id, assigned in insertion order.
pub type InnerId = u32;
/// Caller-visible id, unique across the index.
pub type LabelId = i64;
