use once_cell::sync::Lazy;
use regex::Regex;

const ZERO_WIDTH: [char; 6] = [
    '\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}', '\u{2060}', '\u{00ad}',
];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[\s\-+_`'".,:;|/\\]+"#).unwrap());

/// Precomputed normalized views of one text payload.
pub struct NormalizedText {
    pub lowered: String,
    pub compact: String,
}

/// Reduces simple obfuscation tricks before rule matching: NFKC
/// canonicalization, zero-width character removal, whitespace collapsing,
/// a lowercase view, and a separator-stripped view for split-token bypasses.
pub fn normalize_text(text: &str) -> NormalizedText {
    let nfkc: String = unicode_normalization::UnicodeNormalization::nfkc(text).collect();
    let stripped: String = nfkc.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();
    let collapsed = WHITESPACE.replace_all(&stripped, " ").trim().to_string();

    let lowered = collapsed.to_lowercase();
    let compact = SEPARATORS.replace_all(&lowered, "").to_string();
    NormalizedText { lowered, compact }
}
