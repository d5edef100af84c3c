pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  #[error("not enough memory: {0}")]
  NoEnoughMemory(String),

  #[error("read error: {0}")]
  ReadError(String),

  #[error("index is not empty")]
  IndexNotEmpty,

  #[error("internal error: {0}")]
  Internal(String),
}
