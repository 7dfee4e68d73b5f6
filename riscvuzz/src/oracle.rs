//! Differential comparison of result blobs.
//!
//! Blobs are compared byte for byte with no interpretation of their
//! contents. The text diff exists only so an operator can read a divergence
//! in the logs.

use difference::{Changeset, Difference};
use serde::Serialize;

use crate::util::{blob_text, serialize_hex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Divergence {
        #[serde(skip_serializing)]
        batch_index: usize,
        #[serde(serialize_with = "serialize_hex")]
        a: Vec<u8>,
        #[serde(serialize_with = "serialize_hex")]
        b: Vec<u8>,
    },
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }
}

/// Byte-exact comparison of the two blobs reported for `batch_index`.
pub fn compare(batch_index: usize, a: &[u8], b: &[u8]) -> Verdict {
    if a == b {
        Verdict::Match
    } else {
        Verdict::Divergence {
            batch_index,
            a: a.to_vec(),
            b: b.to_vec(),
        }
    }
}

/// One oracle decision, together with the two sources that were compared.
/// For a repeat run both sources name the same board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonResult {
    pub batch_index: usize,
    pub left: String,
    pub right: String,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl ComparisonResult {
    pub fn new(batch_index: usize, left: &str, right: &str, a: &[u8], b: &[u8]) -> Self {
        Self {
            batch_index,
            left: left.to_string(),
            right: right.to_string(),
            verdict: compare(batch_index, a, b),
        }
    }

    pub fn is_match(&self) -> bool {
        self.verdict.is_match()
    }
}

/// Word-level diff of two blobs rendered as text, with removals as
/// `[-old-]` and additions as `{+new+}`.
pub fn render_diff(a: &[u8], b: &[u8]) -> String {
    let changeset = Changeset::new(&blob_text(a), &blob_text(b), " ");
    changeset
        .diffs
        .iter()
        .map(|diff| match diff {
            Difference::Same(s) => s.clone(),
            Difference::Rem(s) => format!("[-{s}-]"),
            Difference::Add(s) => format!("{{+{s}+}}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn identical_blobs_match() {
        for blob in [&b""[..], b"x1=0x0", &[0xff; 64]] {
            assert_eq!(compare(3, blob, blob), Verdict::Match);
        }
    }

    #[test]
    fn different_blobs_diverge_at_their_batch() {
        let verdict = compare(7, b"x1=0x1", b"x1=0x2");
        assert_matches!(
            verdict,
            Verdict::Divergence { batch_index: 7, a: ref left, b: ref right }
                if left == b"x1=0x1" && right == b"x1=0x2"
        );
        // A blob that is a prefix of the other is still a divergence.
        assert!(!compare(0, b"abc", b"abcd").is_match());
    }

    #[test]
    fn diff_marks_changed_words() {
        let diff = render_diff(b"pc=0x10 x1=0x1 ok", b"pc=0x10 x1=0x2 ok");
        assert_eq!(diff, "pc=0x10 [-x1=0x1-] {+x1=0x2+} ok");
    }

    #[test]
    fn comparisons_serialize_with_hex_blobs() {
        let result = ComparisonResult::new(2, "a", "b", &[0x01], &[0x02]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "batch_index": 2,
                "left": "a",
                "right": "b",
                "verdict": "divergence",
                "a": "01",
                "b": "02",
            })
        );
    }
}
