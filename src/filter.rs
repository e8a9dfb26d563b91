/// Substrings rejected unless the blacklist is replaced.
pub const DEFAULT_BLACKLIST: &[&str] = &["..", "cgi-bin"];

/// Blacklist of substrings that disqualify a path from local service.
#[derive(Debug, Clone, PartialEq)]
pub struct PathFilter {
    patterns: Vec<Vec<u8>>,
}

impl PathFilter {
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Add a substring. Empty patterns would match every path and are ignored.
    pub fn add(&mut self, pattern: &str) {
        if !pattern.is_empty() {
            self.patterns.push(pattern.as_bytes().to_vec());
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Return the first pattern contained in `path`, if any.
    pub fn find_match(&self, path: &[u8]) -> Option<&[u8]> {
        self.patterns
            .iter()
            .find(|pattern| contains(path, pattern))
            .map(Vec::as_slice)
    }

    pub fn is_blocked(&self, path: &[u8]) -> bool {
        self.find_match(path).is_some()
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        let mut filter = Self::empty();
        for pattern in DEFAULT_BLACKLIST {
            filter.add(pattern);
        }
        filter
    }
}

/// Return true if `needle` occurs anywhere in `haystack`.
fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("/var/www/index.html", false ; "plain")]
    #[test_case("/var/www/../etc/passwd", true ; "parent traversal")]
    #[test_case("/var/www/a..b", true ; "double dot anywhere")]
    #[test_case("/var/www/cgi-bin/env", true ; "cgi directory")]
    #[test_case("/var/www/cgi-binary", true ; "cgi prefix")]
    #[test_case("/var/www/.hidden", false ; "single dot")]
    fn default_filter(path: &str, blocked: bool) {
        assert_eq!(PathFilter::default().is_blocked(path.as_bytes()), blocked);
    }

    #[test]
    fn custom_patterns() {
        let mut filter = PathFilter::empty();
        assert!(!filter.is_blocked(b"/var/www/../x"));
        filter.add("");
        assert!(filter.is_empty());
        filter.add(".git");
        filter.add("secret");
        assert_eq!(filter.len(), 2);
        assert_eq!(filter.find_match(b"/srv/repo/.git/config"), Some(&b".git"[..]));
        assert_eq!(filter.find_match(b"/srv/top-secret.txt"), Some(&b"secret"[..]));
        assert_eq!(filter.find_match(b"/srv/gi"), None);
    }
}
