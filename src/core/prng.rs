// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives weight initialisation, exploration and probabilistic forgetting.
// Every owner receives its own instance so a fixed seed reproduces a run.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    pub(crate) fn from_state(state: u64) -> Self {
        Self::new(state)
    }

    pub(crate) fn state(&self) -> u64 {
        self.state
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32() >> 8;
        (x as f32) / (1u32 << 24) as f32
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        let v = self.next_u64() % span;
        low + v as usize
    }

    /// True with probability `p` (clamped to [0,1]).
    ///
    /// `p == 0` never draws true and `p == 1` always does, so disabled
    /// exploration stays exactly deterministic.
    #[inline]
    pub fn gen_bool(&mut self, p: f32) -> bool {
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        self.next_f32_01() < p
    }
}

impl Default for Prng {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn zero_seed_is_remapped() {
        let mut rng = Prng::new(0);
        assert_ne!(rng.state(), 0);
        assert_ne!(rng.next_u32(), 0);
    }

    #[test]
    fn unit_interval_and_ranges() {
        let mut rng = Prng::new(99);
        for _ in 0..1000 {
            let x = rng.next_f32_01();
            assert!((0.0..1.0).contains(&x));
            let y = rng.gen_range_f32(-0.5, 0.5);
            assert!((-0.5..0.5).contains(&y));
            let i = rng.gen_range_usize(3, 9);
            assert!((3..9).contains(&i));
        }
        assert_eq!(rng.gen_range_usize(4, 4), 4);
    }

    #[test]
    fn gen_bool_extremes_are_exact() {
        let mut rng = Prng::new(5);
        let before = rng.state();
        assert!(!rng.gen_bool(0.0));
        assert!(rng.gen_bool(1.0));
        assert_eq!(rng.state(), before, "extremes must not consume randomness");
    }

    #[test]
    fn state_roundtrip_resumes_sequence() {
        let mut a = Prng::new(1234);
        a.next_u32();
        let mut b = Prng::from_state(a.state());
        assert_eq!(a.next_u32(), b.next_u32());
    }
}
