// Label codec
//
// Maps raw bytes to DNS-label-safe text (base64url, padding stripped) and
// splits that text into labels of at most 63 characters. Padding is rebuilt
// on decode rather than transmitted.

use crate::{FerryError, Result, MAX_LABEL_LEN, MAX_QNAME_LEN, QNAME_SAFETY_MARGIN};
use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};

/// Result of a budget-aware encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budgeted {
    /// Labels to place in front of the suffix
    pub labels: Vec<String>,
    /// Payload bytes fully represented by `labels`
    pub consumed: usize,
}

/// Label codec
///
/// In plain mode every payload byte is encoded. In budget-aware mode the codec
/// knows the length of the suffix that will follow the labels (index label,
/// base domain) and stops emitting labels before the whole name would come
/// within [`QNAME_SAFETY_MARGIN`] characters of [`MAX_QNAME_LEN`].
#[derive(Debug, Clone, Default)]
pub struct LabelCodec {
    /// Length of the text appended after the payload labels, excluding the
    /// separating dot. `None` disables the budget.
    suffix_len: Option<usize>,
}

impl LabelCodec {
    /// Codec without a length budget
    pub fn new() -> Self {
        Self { suffix_len: None }
    }

    /// Codec that keeps `<labels>.<suffix>` under the name budget
    pub fn budgeted(suffix: &str) -> Self {
        Self {
            suffix_len: Some(suffix.len()),
        }
    }

    /// Encode a payload into ordered labels.
    ///
    /// An empty payload yields no labels. In budget-aware mode the returned
    /// labels may cover only a prefix of the payload; use
    /// [`encode_budgeted`](Self::encode_budgeted) to learn how much.
    pub fn encode(&self, payload: &[u8]) -> Vec<String> {
        self.encode_budgeted(payload).labels
    }

    /// Encode a payload and report how many bytes the labels cover
    pub fn encode_budgeted(&self, payload: &[u8]) -> Budgeted {
        let text = URL_SAFE_NO_PAD.encode(payload);

        let take = match self.suffix_len {
            None => text.len(),
            Some(suffix_len) => {
                let capacity = payload_char_capacity(suffix_len);
                if capacity >= text.len() {
                    text.len()
                } else {
                    // Cut on a quad boundary so the prefix decodes to whole bytes
                    capacity - capacity % 4
                }
            }
        };

        let consumed = if take == text.len() {
            payload.len()
        } else {
            take / 4 * 3
        };

        Budgeted {
            labels: split_into_labels(&text[..take]),
            consumed,
        }
    }

    /// Decode joined label text back into bytes.
    ///
    /// Padding is appended until the length is a multiple of four. Text with
    /// characters outside the URL-safe alphabet fails with
    /// [`FerryError::Decode`].
    pub fn decode(text: &str) -> Result<Vec<u8>> {
        if text.len() % 4 == 1 {
            return Err(FerryError::Decode(format!(
                "impossible base64 length {} for {:?}",
                text.len(),
                text
            )));
        }

        let mut padded = String::with_capacity(text.len() + 3);
        padded.push_str(text);
        while padded.len() % 4 != 0 {
            padded.push('=');
        }

        URL_SAFE
            .decode(padded.as_bytes())
            .map_err(|e| FerryError::Decode(format!("{}: {:?}", e, text)))
    }

    /// Reject a query name with an over-long label or total length.
    ///
    /// Runs before every outbound send. Never truncates.
    pub fn validate(qname: &str) -> Result<()> {
        for label in qname.split('.') {
            if label.len() > MAX_LABEL_LEN {
                return Err(FerryError::LabelTooLong {
                    label: label.to_string(),
                    len: label.len(),
                });
            }
        }

        let len = qname.trim_end_matches('.').len();
        if len > MAX_QNAME_LEN {
            return Err(FerryError::NameTooLong {
                name: qname.to_string(),
                len,
            });
        }

        Ok(())
    }

    /// Largest chunk size whose chunk name fits under the budget, given the
    /// base domain and the number of digits in the largest index.
    pub fn max_payload_per_query(base_domain: &str, index_digits: usize) -> usize {
        // "<index>.<base>"
        let suffix_len = index_digits + 1 + base_domain.len();
        payload_char_capacity(suffix_len) * 3 / 4
    }
}

/// Number of base64 characters that fit in front of a suffix of the given
/// length, counting one dot after every label.
fn payload_char_capacity(suffix_len: usize) -> usize {
    let budget = (MAX_QNAME_LEN - QNAME_SAFETY_MARGIN).saturating_sub(suffix_len);

    let mut chars = budget;
    while chars > 0 && chars + chars.div_ceil(MAX_LABEL_LEN) > budget {
        chars -= 1;
    }
    chars
}

/// Split encoded text into labels of at most 63 characters
fn split_into_labels(s: &str) -> Vec<String> {
    s.as_bytes()
        .chunks(MAX_LABEL_LEN)
        // base64 output is ASCII, so every byte boundary is a char boundary
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_abc() {
        let labels = LabelCodec::new().encode(b"abc");
        assert_eq!(labels, vec!["YWJj".to_string()]);
        assert_eq!(LabelCodec::decode("YWJj").unwrap(), b"abc");
    }

    #[test]
    fn test_padding_is_stripped_and_rebuilt() {
        let labels = LabelCodec::new().encode(b"ab");
        assert_eq!(labels, vec!["YWI".to_string()]);
        assert_eq!(LabelCodec::decode("YWI").unwrap(), b"ab");
    }

    #[test]
    fn test_empty_payload() {
        assert!(LabelCodec::new().encode(b"").is_empty());
        assert!(LabelCodec::decode("").unwrap().is_empty());
    }

    #[test]
    fn test_url_safe_alphabet() {
        // 0xfb 0xff encodes to "-_8" in the URL-safe alphabet
        let labels = LabelCodec::new().encode(&[0xfb, 0xff]);
        assert_eq!(labels, vec!["-_8".to_string()]);
        assert_eq!(LabelCodec::decode("-_8").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn test_long_payload_splits_at_63() {
        let payload = vec![0x5a; 100];
        let labels = LabelCodec::new().encode(&payload);

        // 100 bytes -> 134 chars -> 63 + 63 + 8
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[0].len(), 63);
        assert_eq!(labels[1].len(), 63);
        assert_eq!(labels[2].len(), 8);

        let joined: String = labels.concat();
        assert_eq!(LabelCodec::decode(&joined).unwrap(), payload);
    }

    #[test]
    fn test_decode_rejects_foreign_characters() {
        assert!(matches!(
            LabelCodec::decode("YW+j"),
            Err(FerryError::Decode(_))
        ));
        assert!(matches!(
            LabelCodec::decode("YW*j"),
            Err(FerryError::Decode(_))
        ));
        assert!(matches!(LabelCodec::decode("Y"), Err(FerryError::Decode(_))));
    }

    #[test]
    fn test_validate_label_length() {
        let ok = format!("{}.0.example.com", "a".repeat(63));
        assert!(LabelCodec::validate(&ok).is_ok());

        let bad = format!("{}.0.example.com", "a".repeat(64));
        match LabelCodec::validate(&bad) {
            Err(FerryError::LabelTooLong { len, .. }) => assert_eq!(len, 64),
            other => panic!("expected LabelTooLong, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_name_length() {
        let label = "a".repeat(60);
        let name = vec![label.as_str(); 5].join(".");
        assert!(name.len() > MAX_QNAME_LEN);
        assert!(matches!(
            LabelCodec::validate(&name),
            Err(FerryError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_budget_keeps_name_under_ceiling() {
        let suffix = "17.exfil.example.com";
        let codec = LabelCodec::budgeted(suffix);
        let payload = vec![0xa5; 400];

        let out = codec.encode_budgeted(&payload);
        assert!(out.consumed > 0);
        assert!(out.consumed < payload.len());

        let name = format!("{}.{}", out.labels.join("."), suffix);
        assert!(name.len() <= MAX_QNAME_LEN - QNAME_SAFETY_MARGIN);
        assert!(LabelCodec::validate(&name).is_ok());

        let decoded = LabelCodec::decode(&out.labels.concat()).unwrap();
        assert_eq!(decoded, &payload[..out.consumed]);
    }

    #[test]
    fn test_budget_passes_small_payload_whole() {
        let codec = LabelCodec::budgeted("0.exfil.example.com");
        let out = codec.encode_budgeted(&[7u8; 30]);
        assert_eq!(out.consumed, 30);
        assert_eq!(out.labels, LabelCodec::new().encode(&[7u8; 30]));
    }

    #[test]
    fn test_max_payload_per_query() {
        let base = "exfil.example.com";
        let max = LabelCodec::max_payload_per_query(base, 6);
        assert!(max >= 48);

        let labels = LabelCodec::new().encode(&vec![1u8; max]);
        let name = format!("{}.999999.{}", labels.join("."), base);
        assert!(name.len() <= MAX_QNAME_LEN - QNAME_SAFETY_MARGIN);
    }
}
