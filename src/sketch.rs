//! The KMV (K-Minimum-Values) sketch: a bounded, sorted sample of the
//! smallest distinct 64-bit hashes seen in a stream, supporting unbiased
//! cardinality estimation and sample-based set algebra (union, direct
//! sum, Jaccard).
//!
//! Values are kept in strictly descending order internally, so the
//! eviction check at full capacity is a single comparison against
//! `values[0]`, the current largest of the retained minima.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;

const BYTES_U64: usize = 8;

/// A sample of the `k` smallest distinct 64-bit hashes ever offered to
/// this sketch, kept in strictly descending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sketch {
    k: usize,
    values: Vec<u64>,
}

impl Sketch {
    /// Creates an empty sketch with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `k == 0`; a zero-capacity sketch cannot retain samples.
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "sketch capacity must be positive");
        Sketch {
            k,
            values: Vec::new(),
        }
    }

    /// Decodes a sketch from its external byte layout: an 8-byte
    /// big-endian capacity header followed by the retained hashes,
    /// each 8 bytes big-endian, descending.
    ///
    /// An empty slice decodes to an empty sketch of the given default
    /// capacity, preserving the "missing key ≡ empty sketch" convention.
    /// A non-empty slice shorter than 8 bytes, or one whose trailing
    /// run of values is not a whole number of 8-byte hashes, is
    /// malformed.
    pub fn decode(bytes: &[u8], default_k: usize) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Ok(Sketch::new(default_k));
        }
        if bytes.len() < BYTES_U64 {
            return Err(Error::Malformed("sketch header truncated".into()));
        }
        let rest = &bytes[BYTES_U64..];
        if rest.len() % BYTES_U64 != 0 {
            return Err(Error::Malformed(
                "sketch value run is not a multiple of 8 bytes".into(),
            ));
        }
        let k = BigEndian::read_u64(&bytes[..BYTES_U64]) as usize;
        if k == 0 {
            return Err(Error::Malformed("sketch capacity must be positive".into()));
        }
        let n = rest.len() / BYTES_U64;
        if n > k {
            return Err(Error::Malformed(
                "sketch value count exceeds its own capacity".into(),
            ));
        }
        let mut values = Vec::with_capacity(n);
        for chunk in rest.chunks_exact(BYTES_U64) {
            values.push(BigEndian::read_u64(chunk));
        }
        Ok(Sketch { k, values })
    }

    /// Encodes this sketch to its external byte layout: an 8-byte
    /// big-endian capacity header followed by the retained hashes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BYTES_U64 * (1 + self.values.len()));
        let mut header = [0u8; BYTES_U64];
        BigEndian::write_u64(&mut header, self.k as u64);
        out.extend_from_slice(&header);
        for &v in &self.values {
            let mut buf = [0u8; BYTES_U64];
            BigEndian::write_u64(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        out
    }

    /// Number of hashes currently retained.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no hash has been retained yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Maximum sample size (capacity).
    pub fn capacity(&self) -> usize {
        self.k
    }

    /// The `i`-th retained hash, indexed in descending order (index 0
    /// is the current maximum of the retained minima).
    pub fn get(&self, i: usize) -> u64 {
        self.values[i]
    }

    /// Retained hashes, descending.
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Rebuilds a sketch from an already-descending, already-deduplicated
    /// value list, used when a nested query result is fed back in as a
    /// sketch.
    pub(crate) fn from_parts(k: usize, values: Vec<u64>) -> Self {
        Sketch { k, values }
    }

    /// Adds a hash to the sample if it belongs there. Returns whether
    /// the sketch changed.
    ///
    /// A hash larger than every retained value is rejected outright
    /// once the sketch is full; otherwise the hash is inserted in
    /// sorted position (evicting the current maximum if already at
    /// capacity) unless it is already present.
    pub fn add_hash(&mut self, h: u64) -> bool {
        let n = self.values.len();
        if n == self.k {
            if let Some(&max) = self.values.first() {
                if h > max {
                    return false;
                }
            }
        }
        match self.values.binary_search_by(|v| v.cmp(&h).reverse()) {
            Ok(_) => false,
            Err(idx) => {
                if n == self.k {
                    self.values.remove(0);
                    let idx = idx.saturating_sub(1);
                    self.values.insert(idx, h);
                } else {
                    self.values.insert(idx, h);
                }
                true
            }
        }
    }

    /// KMV unbiased cardinality estimator: exact while the sample
    /// hasn't filled, otherwise `(k - 1) * 2^64-1 / v_max`.
    pub fn cardinality(&self) -> f64 {
        let n = self.values.len();
        if n < self.k {
            return n as f64;
        }
        let v_max = self.values[0];
        cardinality_from_max(self.k, v_max)
    }

    /// Relative error bound of the cardinality estimator:
    /// `sqrt(2 / (pi * (k - 2)))`.
    pub fn relative_error(&self) -> f64 {
        relative_error(self.k)
    }

    /// Changes this sketch's capacity. Shrinking truncates to the
    /// `new_k` smallest retained hashes; growing leaves the sample
    /// untouched.
    pub fn resize(&mut self, new_k: usize) -> Result<(), Error> {
        if new_k == 0 {
            return Err(Error::InvalidSize("resize target must be positive".into()));
        }
        if new_k < self.k && self.values.len() > new_k {
            self.values = self.values.split_off(self.values.len() - new_k);
        }
        self.k = new_k;
        Ok(())
    }

    /// Does this sketch contain `h`?
    fn contains(&self, h: u64) -> bool {
        self.values.binary_search_by(|v| v.cmp(&h).reverse()).is_ok()
    }
}

fn relative_error(k: usize) -> f64 {
    (2.0 / (std::f64::consts::PI * (k as f64 - 2.0))).sqrt()
}

fn cardinality_from_max(k: usize, v_max: u64) -> f64 {
    let hash_max = u64::MAX as f64;
    (k as f64 - 1.0) * hash_max / v_max as f64
}

/// Smallest capacity among a non-empty slice of sketches.
fn smallest_k(sketches: &[&Sketch]) -> usize {
    sketches.iter().map(|s| s.capacity()).min().expect("non-empty")
}

/// Merges `sketches` into a single sketch of capacity `K = min kᵢ`,
/// keeping the `K` smallest distinct hashes across all inputs.
///
/// Every input whose current candidate hash equals the chosen minimum
/// is advanced together, so the result never contains duplicates
/// without needing a second deduplication pass.
pub fn union(sketches: &[&Sketch]) -> Sketch {
    assert!(!sketches.is_empty(), "union requires at least one sketch");
    let k = smallest_k(sketches);

    // Each sketch stores its retained hashes descending, so the smallest
    // unconsumed value of a sketch sits at the back. Walk every input
    // from its tail forward (ascending value order), always taking the
    // overall smallest unconsumed candidate and advancing every input
    // tied with it, until `k` distinct values have been chosen.
    let mut remaining: Vec<usize> = sketches.iter().map(|s| s.len()).collect();
    let mut out = Vec::with_capacity(k);

    while out.len() < k {
        let mut candidate: Option<u64> = None;
        for (j, s) in sketches.iter().enumerate() {
            if remaining[j] > 0 {
                let v = s.get(remaining[j] - 1);
                candidate = Some(match candidate {
                    None => v,
                    Some(c) => c.min(v),
                });
            }
        }
        let candidate = match candidate {
            Some(c) => c,
            None => break,
        };
        for (j, s) in sketches.iter().enumerate() {
            if remaining[j] > 0 && s.get(remaining[j] - 1) == candidate {
                remaining[j] -= 1;
            }
        }
        out.push(candidate);
    }

    out.reverse();
    Sketch { k, values: out }
}

/// Returns `(union(sketches), n)` where `n` is the number of values in
/// the union that are present in *every* input sketch.
pub fn direct_sum(sketches: &[&Sketch]) -> (Sketch, usize) {
    let u = union(sketches);
    let mut n = 0;
    for &h in u.values() {
        if sketches.iter().all(|s| s.contains(h)) {
            n += 1;
        }
    }
    (u, n)
}

/// Jaccard similarity estimate: `n / K` from `direct_sum`.
pub fn jaccard(sketches: &[&Sketch]) -> f64 {
    let k = smallest_k(sketches);
    let (_, n) = direct_sum(sketches);
    n as f64 / k as f64
}

/// Estimated cardinality of the union.
pub fn cardinality_union(sketches: &[&Sketch]) -> f64 {
    union(sketches).cardinality()
}

/// Estimated cardinality of the intersection: `(n / K) * union.cardinality()`.
pub fn cardinality_intersection(sketches: &[&Sketch]) -> f64 {
    let k = smallest_k(sketches);
    let (u, n) = direct_sum(sketches);
    (n as f64 / k as f64) * u.cardinality()
}
