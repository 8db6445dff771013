use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter bumped on every stop. Work captured under an older
/// value is stale and must discard itself after each suspension point.
#[derive(Debug, Default)]
pub struct Generation(AtomicU64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationToken(u64);

impl Generation {
    pub fn current(&self) -> GenerationToken {
        GenerationToken(self.0.load(Ordering::SeqCst))
    }

    /// Invalidate every outstanding token and return the new one.
    pub fn bump(&self) -> GenerationToken {
        GenerationToken(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, token: GenerationToken) -> bool {
        self.0.load(Ordering::SeqCst) == token.0
    }
}

impl std::fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_invalidates_older_tokens() {
        let gen = Generation::default();
        let before = gen.current();
        let after = gen.bump();
        assert!(!gen.is_current(before));
        assert!(gen.is_current(after));
        assert_eq!(gen.current(), after);
    }
}
