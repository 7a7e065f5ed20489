use url::form_urlencoded;
use url::Url;

const MODE_KEY: &str = "mode";
const POPOUT_MODE: &str = "popout";

/// Whether the widget document was opened as a detached pop-out window.
///
/// Accepts a full URL or a bare query string (with or without the leading `?`).
pub fn is_popped_out(location: &str) -> bool {
    match Url::parse(location) {
        Ok(url) => url
            .query_pairs()
            .any(|(k, v)| k == MODE_KEY && v == POPOUT_MODE),
        Err(_) => {
            let query = location.split_once('?').map_or(location, |(_, q)| q);
            let query = query.split('#').next().unwrap_or_default();
            form_urlencoded::parse(query.as_bytes()).any(|(k, v)| k == MODE_KEY && v == POPOUT_MODE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_url_with_popout_mode() {
        assert!(is_popped_out("https://example.com/livechat?mode=popout"));
        assert!(is_popped_out("https://example.com/livechat?lang=en&mode=popout#/register"));
    }

    #[test]
    fn full_url_without_mode() {
        assert!(!is_popped_out("https://example.com/livechat"));
        assert!(!is_popped_out("https://example.com/livechat?mode=embedded"));
    }

    #[test]
    fn bare_query_strings() {
        assert!(is_popped_out("?mode=popout"));
        assert!(is_popped_out("mode=popout&x=1"));
        assert!(is_popped_out("/livechat?mode=popout#top"));
        assert!(!is_popped_out("?popout=mode"));
        assert!(!is_popped_out(""));
    }

    #[test]
    fn value_is_exact() {
        assert!(!is_popped_out("?mode=POPOUT"));
        assert!(!is_popped_out("?mode=popouts"));
    }
}
