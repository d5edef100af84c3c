use crate::error::Error;
use crate::error::Result;
use crate::io::StreamReader;
use crate::io::StreamWriter;
use crate::InnerId;
use parking_lot::RwLock;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Fixed-stride opaque payload per inner id. Storage is pre-extended with
/// zero fill on reserve so readers racing a batch insert stay in bounds.
#[derive(Debug)]
pub struct ExtraInfoStore {
  info_size: usize,
  data: RwLock<Vec<u8>>,
  total: AtomicUsize,
}

impl ExtraInfoStore {
  pub fn new(info_size: usize) -> Self {
    Self {
      info_size,
      data: RwLock::new(Vec::new()),
      total: AtomicUsize::new(0),
    }
  }

  pub fn info_size(&self) -> usize {
    self.info_size
  }

  pub fn total_count(&self) -> usize {
    self.total.load(Ordering::Acquire)
  }

  pub fn in_memory(&self) -> bool {
    true
  }

  pub fn reserve(&self, capacity: usize) {
    let mut data = self.data.write();
    let want = capacity * self.info_size;
    if want > data.len() {
      data.resize(want, 0);
    }
  }

  pub fn batch_insert(&self, infos: &[u8]) -> Result<()> {
    if infos.len() % self.info_size != 0 {
      return Err(Error::InvalidArgument(format!(
        "extra info length {} is not a multiple of size {}",
        infos.len(),
        self.info_size
      )));
    }
    let rows = infos.len() / self.info_size;
    let start = self.total_count() * self.info_size;
    let mut data = self.data.write();
    if data.len() < start + infos.len() {
      data.resize(start + infos.len(), 0);
    }
    data[start..start + infos.len()].copy_from_slice(infos);
    drop(data);
    self.total.fetch_add(rows, Ordering::AcqRel);
    Ok(())
  }

  /// Copies the payload of `id` into `out`.
  pub fn get(&self, id: InnerId, out: &mut [u8]) {
    debug_assert_eq!(out.len(), self.info_size);
    let data = self.data.read();
    let start = id as usize * self.info_size;
    out.copy_from_slice(&data[start..start + self.info_size]);
  }

  pub fn save(&self, w: &mut StreamWriter) -> Result<()> {
    let data = self.data.read();
    let total = self.total_count();
    w.write_u64(self.info_size as u64)?;
    w.write_u64(total as u64)?;
    w.write_bytes(&data[..total * self.info_size])
  }

  pub fn load(&self, r: &mut StreamReader) -> Result<()> {
    let info_size = r.read_u64()? as usize;
    if info_size != self.info_size {
      return Err(Error::ReadError(format!(
        "extra info size mismatch: stored {info_size}, configured {}",
        self.info_size
      )));
    }
    let total = r.read_u64()? as usize;
    *self.data.write() = r.read_bytes(total * self.info_size)?;
    self.total.store(total, Ordering::Release);
    Ok(())
  }
}
