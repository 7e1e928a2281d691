//! Generator data patterns, per (card family, pattern) pair.
//!
//! The CRU data emulator writes every 8th 32-bit word of a page; the CRORC
//! generator writes the event counter into word 0, skips the SDH (words
//! 1..8) and fills the rest. These pure functions are shared by the
//! benchmark's error check and the in-process card models, so the two can
//! never drift apart.

use crate::params::{CardType, GeneratorPattern};

/// The CRU emulator touches every `PATTERN_STRIDE`-th word.
pub const PATTERN_STRIDE: usize = 8;

/// Expected value of `word` (index within one DMA page) for an event with
/// the given generator counter, or `None` for words the generator does not
/// write (SDH words, non-stride words, and everything under `Random`).
pub fn expected_word(
    card: CardType,
    pattern: GeneratorPattern,
    counter: u32,
    word: usize,
) -> Option<u32> {
    match (card, pattern) {
        (_, GeneratorPattern::Random) => None,
        (CardType::Cru, pattern) => {
            if word % PATTERN_STRIDE != 0 {
                return None;
            }
            Some(match pattern {
                GeneratorPattern::Incremental => {
                    counter.wrapping_mul(256) + (word / PATTERN_STRIDE) as u32
                }
                GeneratorPattern::Alternating => 0xa5a5_a5a5,
                GeneratorPattern::Constant => 0x1234_5678,
                GeneratorPattern::Random => unreachable!(),
            })
        }
        (CardType::Crorc, pattern) => match word {
            0 => Some(counter),
            // SDH words; the generator leaves them to the protocol.
            1..=7 => None,
            _ => Some(match pattern {
                GeneratorPattern::Incremental => (word - 1) as u32,
                GeneratorPattern::Alternating => 0xa5a5_a5a5,
                GeneratorPattern::Constant => 0x1234_5678,
                GeneratorPattern::Random => unreachable!(),
            }),
        },
    }
}

/// Recover the generator counter from the first word of a page.
pub fn counter_from_page(card: CardType, first_word: u32) -> u32 {
    match card {
        CardType::Crorc => first_word,
        CardType::Cru => first_word / 256,
    }
}

/// First mismatching word of a page, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMismatch {
    pub word: usize,
    pub expected: u32,
    pub actual: u32,
}

/// Check one DMA page against the pattern for event `counter`.
pub fn check_page(
    card: CardType,
    pattern: GeneratorPattern,
    counter: u32,
    page: &[u32],
) -> Result<(), PatternMismatch> {
    for (word, &actual) in page.iter().enumerate() {
        if let Some(expected) = expected_word(card, pattern, counter, word) {
            if actual != expected {
                return Err(PatternMismatch {
                    word,
                    expected,
                    actual,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cru_incremental_touches_every_eighth_word() {
        assert_eq!(
            expected_word(CardType::Cru, GeneratorPattern::Incremental, 3, 0),
            Some(3 * 256)
        );
        assert_eq!(
            expected_word(CardType::Cru, GeneratorPattern::Incremental, 3, 16),
            Some(3 * 256 + 2)
        );
        assert_eq!(
            expected_word(CardType::Cru, GeneratorPattern::Incremental, 3, 5),
            None
        );
    }

    #[test]
    fn crorc_incremental_counts_from_word_eight() {
        assert_eq!(
            expected_word(CardType::Crorc, GeneratorPattern::Incremental, 7, 0),
            Some(7)
        );
        assert_eq!(
            expected_word(CardType::Crorc, GeneratorPattern::Incremental, 7, 3),
            None
        );
        assert_eq!(
            expected_word(CardType::Crorc, GeneratorPattern::Incremental, 7, 8),
            Some(7)
        );
        assert_eq!(
            expected_word(CardType::Crorc, GeneratorPattern::Incremental, 7, 100),
            Some(99)
        );
    }

    #[test]
    fn counter_recovery_matches_family_layout() {
        assert_eq!(counter_from_page(CardType::Crorc, 41), 41);
        assert_eq!(counter_from_page(CardType::Cru, 41 * 256 + 7), 41);
    }

    #[test]
    fn check_page_reports_first_mismatch() {
        let mut page = vec![0u32; 64];
        for (i, slot) in page.iter_mut().enumerate() {
            if let Some(w) = expected_word(CardType::Cru, GeneratorPattern::Constant, 0, i) {
                *slot = w;
            }
        }
        assert!(check_page(CardType::Cru, GeneratorPattern::Constant, 0, &page).is_ok());

        page[16] = 0xdead_beef;
        let err = check_page(CardType::Cru, GeneratorPattern::Constant, 0, &page).unwrap_err();
        assert_eq!(err.word, 16);
        assert_eq!(err.expected, 0x1234_5678);
    }
}
