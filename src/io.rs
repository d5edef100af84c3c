use crate::error::Error;
use crate::error::Result;
use std::io::Read;
use std::io::Write;

/// Little-endian framing over any byte sink. Write failures surface as
/// NoEnoughMemory, matching the public error table for serialization.
pub struct StreamWriter<'a> {
  w: &'a mut dyn Write,
}

impl<'a> StreamWriter<'a> {
  pub fn new(w: &'a mut dyn Write) -> Self {
    Self { w }
  }

  fn put(&mut self, bytes: &[u8]) -> Result<()> {
    self
      .w
      .write_all(bytes)
      .map_err(|e| Error::NoEnoughMemory(format!("write failed: {e}")))
  }

  pub fn write_u8(&mut self, v: u8) -> Result<()> {
    self.put(&[v])
  }

  pub fn write_u32(&mut self, v: u32) -> Result<()> {
    self.put(&v.to_le_bytes())
  }

  pub fn write_u64(&mut self, v: u64) -> Result<()> {
    self.put(&v.to_le_bytes())
  }

  pub fn write_i64(&mut self, v: i64) -> Result<()> {
    self.put(&v.to_le_bytes())
  }

  pub fn write_f64(&mut self, v: f64) -> Result<()> {
    self.put(&v.to_le_bytes())
  }

  pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
    self.put(bytes)
  }

  pub fn write_u32_slice(&mut self, vals: &[u32]) -> Result<()> {
    self.put(bytemuck::cast_slice(vals))
  }

  pub fn write_f32_slice(&mut self, vals: &[f32]) -> Result<()> {
    self.put(bytemuck::cast_slice(vals))
  }

  pub fn write_i64_slice(&mut self, vals: &[i64]) -> Result<()> {
    self.put(bytemuck::cast_slice(vals))
  }
}

pub struct StreamReader<'a> {
  r: &'a mut dyn Read,
}

impl<'a> StreamReader<'a> {
  pub fn new(r: &'a mut dyn Read) -> Self {
    Self { r }
  }

  fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    self
      .r
      .read_exact(&mut buf)
      .map_err(|e| Error::ReadError(format!("unexpected EOF: {e}")))?;
    Ok(buf)
  }

  pub fn read_u8(&mut self) -> Result<u8> {
    Ok(self.take::<1>()?[0])
  }

  pub fn read_u32(&mut self) -> Result<u32> {
    Ok(u32::from_le_bytes(self.take::<4>()?))
  }

  pub fn read_u64(&mut self) -> Result<u64> {
    Ok(u64::from_le_bytes(self.take::<8>()?))
  }

  pub fn read_i64(&mut self) -> Result<i64> {
    Ok(i64::from_le_bytes(self.take::<8>()?))
  }

  pub fn read_f64(&mut self) -> Result<f64> {
    Ok(f64::from_le_bytes(self.take::<8>()?))
  }

  pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    self
      .r
      .read_exact(&mut buf)
      .map_err(|e| Error::ReadError(format!("unexpected EOF: {e}")))?;
    Ok(buf)
  }

  pub fn read_u32_vec(&mut self, n: usize) -> Result<Vec<u32>> {
    let bytes = self.read_bytes(n * 4)?;
    let mut out = vec![0u32; n];
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
      *dst = u32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
    }
    Ok(out)
  }

  pub fn read_i64_vec(&mut self, n: usize) -> Result<Vec<i64>> {
    let bytes = self.read_bytes(n * 8)?;
    let mut out = vec![0i64; n];
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
      *dst = i64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes"));
    }
    Ok(out)
  }

  pub fn read_f32_vec(&mut self, n: usize) -> Result<Vec<f32>> {
    let bytes = self.read_bytes(n * 4)?;
    let mut out = vec![0.0f32; n];
    if let Ok(src) = bytemuck::try_cast_slice::<u8, f32>(&bytes) {
      out.copy_from_slice(src);
    } else {
      for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *dst = f32::from_bits(u32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes")));
      }
    }
    Ok(out)
  }
}
