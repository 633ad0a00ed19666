use regex::Regex;
use std::sync::OnceLock;

fn link_regex() -> &'static Regex {
    static LINK: OnceLock<Regex> = OnceLock::new();
    LINK.get_or_init(|| {
        Regex::new(r#"<([^>]*)>\s*;\s*rel\s*=\s*"?([A-Za-z]+)"?"#).expect("link pattern is valid")
    })
}

/// Split a `Link` header into `(rel, url)` pairs in header order.
pub fn parse_links(link_header: &str) -> Vec<(&str, &str)> {
    link_regex()
        .captures_iter(link_header)
        .filter_map(|caps| {
            let url = caps.get(1)?.as_str();
            let rel = caps.get(2)?.as_str();
            Some((rel, url))
        })
        .collect()
}

/// URL of the `rel="next"` segment, if the header has one.
pub fn next_page_url(link_header: &str) -> Option<String> {
    parse_links(link_header)
        .into_iter()
        .find(|(rel, _)| *rel == "next")
        .map(|(_, url)| url.to_string())
}
