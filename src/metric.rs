use crate::error::Error;
use crate::error::Result;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

/// Raw distance kernel over two equal-length f32 slices.
pub type DistanceFn = unsafe fn(*const f32, *const f32, usize) -> f32;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum Metric {
  L2,
  InnerProduct,
  Cosine,
}

impl Metric {
  /// Stable on-disk value.
  pub fn wire_value(self) -> u8 {
    match self {
      Metric::L2 => 0,
      Metric::InnerProduct => 1,
      Metric::Cosine => 2,
    }
  }

  pub fn from_wire_value(v: u8) -> Result<Self> {
    match v {
      0 => Ok(Metric::L2),
      1 => Ok(Metric::InnerProduct),
      2 => Ok(Metric::Cosine),
      _ => Err(Error::ReadError(format!("unknown metric value {v}"))),
    }
  }

  /// Cosine stores and queries normalized vectors, then scores as inner product.
  pub fn normalizes(self) -> bool {
    self == Metric::Cosine
  }

  /// Picks the kernel once; the caller caches the returned pointer.
  pub fn distance_fn(self) -> DistanceFn {
    match self {
      Metric::L2 => pick_l2(),
      Metric::InnerProduct | Metric::Cosine => pick_ip(),
    }
  }

  pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    unsafe { (self.distance_fn())(a.as_ptr(), b.as_ptr(), a.len()) }
  }
}

unsafe fn l2_sq_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut acc = 0.0_f32;
  for i in 0..dim {
    let d = *a.add(i) - *b.add(i);
    acc += d * d;
  }
  acc
}

unsafe fn ip_dist_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut dot = 0.0_f32;
  for i in 0..dim {
    dot += *a.add(i) * *b.add(i);
  }
  1.0_f32 - dot
}

#[cfg(target_arch = "x86_64")]
mod x86 {
  use super::DistanceFn;
  use std::arch::x86_64::*;

  #[target_feature(enable = "avx2,fma")]
  pub unsafe fn l2_sq_avx2(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let chunks = dim / 8;
    for c in 0..chunks {
      let va = _mm256_loadu_ps(a.add(c * 8));
      let vb = _mm256_loadu_ps(b.add(c * 8));
      let d = _mm256_sub_ps(va, vb);
      acc = _mm256_fmadd_ps(d, d, acc);
    }
    let mut res = hsum256(acc);
    for i in chunks * 8..dim {
      let d = *a.add(i) - *b.add(i);
      res += d * d;
    }
    res
  }

  #[target_feature(enable = "avx2,fma")]
  pub unsafe fn ip_dist_avx2(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let chunks = dim / 8;
    for c in 0..chunks {
      let va = _mm256_loadu_ps(a.add(c * 8));
      let vb = _mm256_loadu_ps(b.add(c * 8));
      acc = _mm256_fmadd_ps(va, vb, acc);
    }
    let mut dot = hsum256(acc);
    for i in chunks * 8..dim {
      dot += *a.add(i) * *b.add(i);
    }
    1.0_f32 - dot
  }

  #[target_feature(enable = "sse")]
  pub unsafe fn l2_sq_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm_setzero_ps();
    let chunks = dim / 4;
    for c in 0..chunks {
      let va = _mm_loadu_ps(a.add(c * 4));
      let vb = _mm_loadu_ps(b.add(c * 4));
      let d = _mm_sub_ps(va, vb);
      acc = _mm_add_ps(acc, _mm_mul_ps(d, d));
    }
    let mut res = hsum128(acc);
    for i in chunks * 4..dim {
      let d = *a.add(i) - *b.add(i);
      res += d * d;
    }
    res
  }

  #[target_feature(enable = "sse")]
  pub unsafe fn ip_dist_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm_setzero_ps();
    let chunks = dim / 4;
    for c in 0..chunks {
      let va = _mm_loadu_ps(a.add(c * 4));
      let vb = _mm_loadu_ps(b.add(c * 4));
      acc = _mm_add_ps(acc, _mm_mul_ps(va, vb));
    }
    let mut dot = hsum128(acc);
    for i in chunks * 4..dim {
      dot += *a.add(i) * *b.add(i);
    }
    1.0_f32 - dot
  }

  #[inline]
  unsafe fn hsum256(v: __m256) -> f32 {
    let lo = _mm256_castps256_ps128(v);
    let hi = _mm256_extractf128_ps(v, 1);
    hsum128(_mm_add_ps(lo, hi))
  }

  #[inline]
  unsafe fn hsum128(v: __m128) -> f32 {
    let shuf = _mm_movehdup_ps(v);
    let sums = _mm_add_ps(v, shuf);
    let hi = _mm_movehl_ps(shuf, sums);
    _mm_cvtss_f32(_mm_add_ss(sums, hi))
  }

  pub fn pick_l2() -> Option<DistanceFn> {
    if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
      return Some(l2_sq_avx2);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(l2_sq_sse);
    }
    None
  }

  pub fn pick_ip() -> Option<DistanceFn> {
    if std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma") {
      return Some(ip_dist_avx2);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(ip_dist_sse);
    }
    None
  }
}

fn pick_l2() -> DistanceFn {
  #[cfg(target_arch = "x86_64")]
  if let Some(f) = x86::pick_l2() {
    return f;
  }
  l2_sq_scalar
}

fn pick_ip() -> DistanceFn {
  #[cfg(target_arch = "x86_64")]
  if let Some(f) = x86::pick_ip() {
    return f;
  }
  ip_dist_scalar
}

pub fn normalize_in_place(vector: &mut [f32]) {
  let mut norm_sq = 0.0_f32;
  for &v in vector.iter() {
    norm_sq += v * v;
  }
  if norm_sq == 0.0 {
    return;
  }
  let inv_norm = norm_sq.sqrt().recip();
  for v in vector.iter_mut() {
    *v *= inv_norm;
  }
}

/// Read prefetch hint into L1. Purely advisory; never changes results.
#[inline(always)]
pub fn prefetch_read(ptr: *const u8) {
  #[cfg(target_arch = "x86_64")]
  unsafe {
    std::arch::x86_64::_mm_prefetch(ptr as *const i8, std::arch::x86_64::_MM_HINT_T0);
  }
  #[cfg(target_arch = "aarch64")]
  unsafe {
    std::arch::asm!(
      "prfm pldl1keep, [{ptr}]",
      ptr = in(reg) ptr,
      options(nostack, preserves_flags)
    );
  }
  #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
  let _ = ptr;
}
