/// Case-insensitive substring matcher over the configured search terms.
///
/// Terms are lowercased once at construction; `matches` reports which of
/// the original (un-lowercased) terms occur in the given text. Scripts
/// without case (e.g. Hebrew) compare byte-for-byte.
pub struct TermMatcher {
    terms: Vec<String>,
    lowered: Vec<String>,
}

impl TermMatcher {
    pub fn new(terms: &[String]) -> Self {
        Self {
            terms: terms.to_vec(),
            lowered: terms.iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    /// Returns the configured terms that occur in `text`, in configuration
    /// order. Empty result means no match.
    pub fn matches(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        self.lowered
            .iter()
            .zip(&self.terms)
            .filter(|(needle, _)| haystack.contains(needle.as_str()))
            .map(|(_, term)| term.clone())
            .collect()
    }
}
