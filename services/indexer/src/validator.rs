//! Horizontal validation: chunks must form a gapless, non-overlapping
//! cover of the window, and every chunk's logs must sit inside its range.

use crate::chunk::Chunk;
use crate::error::IndexerError;
use indexer_common::BlockWindow;

/// Validation verdict. Anything but `Ok` fails the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// Blocks are missing after the given chunk (`None` = before the first).
    Gap {
        after: Option<usize>,
        missing: (u64, u64),
    },
    Overlap {
        left: usize,
        right: usize,
    },
    OutOfOrder {
        index: usize,
    },
}

impl Verdict {
    pub fn into_error(self) -> Option<IndexerError> {
        match self {
            Verdict::Ok => None,
            Verdict::Gap { after, missing } => Some(IndexerError::ValidationGap {
                after,
                missing_from: missing.0,
                missing_to: missing.1,
            }),
            Verdict::Overlap { left, right } => {
                Some(IndexerError::ValidationOverlap { left, right })
            }
            Verdict::OutOfOrder { index } => Some(IndexerError::ValidationOutOfOrder { index }),
        }
    }
}

/// Validate chunk coverage of `window`. Chunks are checked in index order.
pub fn validate(window: &BlockWindow, chunks: &[Chunk]) -> Verdict {
    let Some(first) = chunks.first() else {
        return Verdict::Gap {
            after: None,
            missing: (window.start_block, window.end_block),
        };
    };

    // Pairwise ordering first: a shuffled list should read as out of order,
    // not as an accidental gap at the window edge.
    for (i, pair) in chunks.windows(2).enumerate() {
        let (left, right) = (&pair[0], &pair[1]);
        if right.from_block <= left.from_block {
            return Verdict::OutOfOrder { index: i + 1 };
        }
        if right.from_block <= left.to_block {
            return Verdict::Overlap { left: i, right: i + 1 };
        }
        if left.to_block + 1 < right.from_block {
            return Verdict::Gap {
                after: Some(i),
                missing: (left.to_block + 1, right.from_block - 1),
            };
        }
    }

    if first.from_block > window.start_block {
        return Verdict::Gap {
            after: None,
            missing: (window.start_block, first.from_block - 1),
        };
    }
    if first.from_block < window.start_block {
        return Verdict::OutOfOrder { index: 0 };
    }

    let last = chunks.last().unwrap();
    if last.to_block < window.end_block {
        return Verdict::Gap {
            after: Some(chunks.len() - 1),
            missing: (last.to_block + 1, window.end_block),
        };
    }
    if last.to_block > window.end_block {
        return Verdict::OutOfOrder {
            index: chunks.len() - 1,
        };
    }

    // Log bounds must fall inside each chunk's range, and the first/last
    // observed logs must be ordered.
    for chunk in chunks {
        if let Some(min) = chunk.min_log_block {
            if min < chunk.from_block {
                return Verdict::OutOfOrder { index: chunk.index };
            }
        }
        if let Some(max) = chunk.max_log_block {
            if max > chunk.to_block {
                return Verdict::OutOfOrder { index: chunk.index };
            }
        }
        if chunk.log_count > 0 {
            if let (Some(first), Some(last)) = (&chunk.first_log, &chunk.last_log) {
                if first.block_number > last.block_number {
                    return Verdict::OutOfOrder { index: chunk.index };
                }
            }
        }
    }

    Verdict::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::plan;
    use chain_common::LogRecord;

    fn window(start: u64, end: u64) -> BlockWindow {
        BlockWindow::new(start, end, start)
    }

    fn chunks_from_ranges(ranges: &[(u64, u64)]) -> Vec<Chunk> {
        ranges
            .iter()
            .enumerate()
            .map(|(i, &(from, to))| {
                let mut chunk = plan(&window(from, to), u64::MAX).remove(0);
                chunk.index = i;
                chunk
            })
            .collect()
    }

    fn log_at(block: u64) -> LogRecord {
        LogRecord {
            block_number: block,
            tx_hash: format!("0x{:x}", block),
            log_index: 0,
            address: "0xae".into(),
            topics: vec![],
            data: "0x".into(),
            tx_from: None,
            tx_to: None,
        }
    }

    #[test]
    fn test_valid_cover() {
        let chunks = chunks_from_ranges(&[(0, 99), (100, 199), (200, 299)]);
        assert_eq!(validate(&window(0, 299), &chunks), Verdict::Ok);
    }

    #[test]
    fn test_detects_gap() {
        let chunks = chunks_from_ranges(&[(0, 99), (100, 199), (201, 299)]);
        assert_eq!(
            validate(&window(0, 299), &chunks),
            Verdict::Gap {
                after: Some(1),
                missing: (200, 200)
            }
        );
    }

    #[test]
    fn test_detects_overlap() {
        let chunks = chunks_from_ranges(&[(0, 150), (100, 200)]);
        assert_eq!(
            validate(&window(0, 200), &chunks),
            Verdict::Overlap { left: 0, right: 1 }
        );
    }

    #[test]
    fn test_detects_out_of_order() {
        let chunks = chunks_from_ranges(&[(100, 199), (0, 99)]);
        assert_eq!(
            validate(&window(0, 199), &chunks),
            Verdict::OutOfOrder { index: 1 }
        );
    }

    #[test]
    fn test_detects_leading_gap() {
        let chunks = chunks_from_ranges(&[(10, 99)]);
        assert_eq!(
            validate(&window(0, 99), &chunks),
            Verdict::Gap {
                after: None,
                missing: (0, 9)
            }
        );
    }

    #[test]
    fn test_detects_trailing_gap() {
        let chunks = chunks_from_ranges(&[(0, 49)]);
        assert_eq!(
            validate(&window(0, 99), &chunks),
            Verdict::Gap {
                after: Some(0),
                missing: (50, 99)
            }
        );
    }

    #[test]
    fn test_empty_chunk_list_is_gap() {
        assert_eq!(
            validate(&window(5, 10), &[]),
            Verdict::Gap {
                after: None,
                missing: (5, 10)
            }
        );
    }

    #[test]
    fn test_log_outside_chunk_range() {
        let mut chunks = chunks_from_ranges(&[(0, 99), (100, 199)]);
        chunks[1].log_count = 1;
        chunks[1].min_log_block = Some(99);
        chunks[1].max_log_block = Some(150);
        assert_eq!(
            validate(&window(0, 199), &chunks),
            Verdict::OutOfOrder { index: 1 }
        );
    }

    #[test]
    fn test_first_log_after_last_log() {
        let mut chunks = chunks_from_ranges(&[(0, 99)]);
        chunks[0].log_count = 2;
        chunks[0].min_log_block = Some(10);
        chunks[0].max_log_block = Some(20);
        chunks[0].first_log = Some(log_at(20));
        chunks[0].last_log = Some(log_at(10));
        assert_eq!(
            validate(&window(0, 99), &chunks),
            Verdict::OutOfOrder { index: 0 }
        );
    }

    #[test]
    fn test_verdict_error_mapping() {
        assert!(Verdict::Ok.into_error().is_none());
        let err = Verdict::Gap {
            after: Some(1),
            missing: (200, 200),
        }
        .into_error()
        .unwrap();
        assert!(matches!(err, IndexerError::ValidationGap { .. }));
    }
}
