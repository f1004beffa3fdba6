//! Uniform random draws from OS entropy.
//!
//! Delay jitter must be cryptographically uniform or the anonymization can
//! be modeled away, so every draw goes straight to the kernel entropy pool
//! and modulo bias is removed by rejection sampling.

use anyhow::{Context, Result};
use rustix::io::Errno;
use rustix::rand::{getrandom, GetRandomFlags};

const ALPHABET_LEN: i32 = 26;

/// Handle to the OS entropy source.
#[derive(Debug, Default)]
pub struct Entropy;

impl Entropy {
    pub fn new() -> Self {
        Self
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            match getrandom(&mut buf[off..], GetRandomFlags::empty()) {
                Ok(n) => off += n,
                Err(Errno::INTR) => continue,
                Err(err) => {
                    return Err(err).context("could not read from the OS entropy source")
                }
            }
        }
        Ok(())
    }

    /// Draws a non-negative 63-bit value.
    fn draw_u63(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok((u64::from_ne_bytes(buf) >> 1) as i64)
    }

    /// Returns an integer uniformly distributed in `[lower, upper]`.
    ///
    /// Degenerate intervals (`lower >= upper`) collapse to `upper`.
    pub fn uniform_in(&mut self, lower: i64, upper: i64) -> Result<i64> {
        assert!(lower >= 0);
        assert!(upper >= 0);

        if lower >= upper {
            return Ok(upper);
        }

        let span = upper - lower + 1;
        let limit = i64::MAX - (i64::MAX % span);
        loop {
            let val = self.draw_u63()?;
            if val < limit {
                return Ok(lower + val % span);
            }
        }
    }

    /// Produces `len` random characters in `[A-Za-z]`.
    pub fn random_alpha(&mut self, len: usize) -> Result<String> {
        let mut out = String::with_capacity(len);
        for _ in 0..len {
            let mut buf = [0u8; 1];
            let val = loop {
                self.fill(&mut buf)?;
                let val = (buf[0] & 0x7f) as i32;
                if val < i8::MAX as i32 - (i8::MAX as i32 % ALPHABET_LEN) {
                    break val % (ALPHABET_LEN * 2);
                }
            };
            let ch = if val < ALPHABET_LEN {
                b'A' + val as u8
            } else {
                b'a' + (val - ALPHABET_LEN) as u8
            };
            out.push(ch as char);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_stays_in_bounds() {
        let mut entropy = Entropy::new();
        for _ in 0..10_000 {
            let val = entropy.uniform_in(3, 17).unwrap();
            assert!((3..=17).contains(&val));
        }
    }

    #[test]
    fn degenerate_interval_collapses() {
        let mut entropy = Entropy::new();
        assert_eq!(entropy.uniform_in(5, 5).unwrap(), 5);
        assert_eq!(entropy.uniform_in(7, 3).unwrap(), 3);
    }

    #[test]
    fn alpha_is_alphabetic() {
        let mut entropy = Entropy::new();
        let name = entropy.random_alpha(64).unwrap();
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_alphabetic()));
    }

    // Empirical check that the jitter distribution is indistinguishable from
    // uniform: 1e5 draws over [0, 100), chi-square against the flat
    // distribution with 100 cells (99 degrees of freedom). The bound is the
    // p = 0.001 critical value, so a correct implementation fails roughly
    // one run in a thousand while a modulo-biased one fails essentially
    // always.
    #[test]
    fn uniformity_chi_square() {
        const DRAWS: usize = 100_000;
        const CELLS: usize = 100;

        let mut entropy = Entropy::new();
        let mut counts = [0u32; CELLS];
        for _ in 0..DRAWS {
            let val = entropy.uniform_in(0, CELLS as i64 - 1).unwrap();
            counts[val as usize] += 1;
        }

        let expected = DRAWS as f64 / CELLS as f64;
        let chi2: f64 = counts
            .iter()
            .map(|&c| {
                let diff = c as f64 - expected;
                diff * diff / expected
            })
            .sum();

        assert!(chi2 < 148.23, "chi-square statistic too large: {chi2}");
    }
}
