//! Filesystem autodetection (spec.md §4.7).

use crate::chunk::ChunkSource;

/// Graded confidence a driver's [`Prober`] returns for a candidate image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    No,
    Barely,
    Maybe,
    Good,
    Yes,
}

/// Heuristic identification of which driver's structural invariants match
/// an unknown image. Each driver implements this by scanning just enough of
/// the candidate image to confirm or reject its own format without fully
/// committing to `prepare_file_access`.
pub trait Prober {
    fn test_image(&self, source: &dyn ChunkSource) -> Confidence;
}

/// Runs every registered prober against a source and returns the name of
/// the best match along with its confidence, highest first. Ties are
/// broken by registration order, trying the more specific formats before
/// falling back to looser ones.
pub fn best_match<'a>(
    source: &dyn ChunkSource,
    probers: &'a [(&'static str, &'a dyn Prober)],
) -> Option<(&'static str, Confidence)> {
    probers
        .iter()
        .map(|(name, prober)| (*name, prober.test_image(source)))
        .max_by_key(|(_, confidence)| *confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always(Confidence);
    impl Prober for Always {
        fn test_image(&self, _source: &dyn ChunkSource) -> Confidence {
            self.0
        }
    }

    #[test]
    fn best_match_picks_highest_confidence() {
        let source = crate::chunk::MemoryChunkSource::new(512);
        let dos = Always(Confidence::Maybe);
        let prodos = Always(Confidence::Good);
        let probers: Vec<(&'static str, &dyn Prober)> =
            vec![("dos33", &dos), ("prodos", &prodos)];
        let (name, confidence) = best_match(&source, &probers).unwrap();
        assert_eq!(name, "prodos");
        assert_eq!(confidence, Confidence::Good);
    }
}
