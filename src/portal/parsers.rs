use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use std::sync::LazyLock;

// ── Login page ────────────────────────────────────────────────────────────────

static SESSION_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:amp;)?sessionDataKey=([a-z0-9\-]+)").expect("static pattern")
});

/// Hidden fields the identity provider hands back after a successful login.
pub const LOGIN_FORM_FIELDS: [&str; 5] = [
    "code",
    "id_token",
    "state",
    "AuthenticatedIdPs",
    "session_state",
];

/// One-time key embedded in the login page, e.g. `...&sessionDataKey=1f2e-...`.
pub fn extract_session_key(body: &str) -> Option<String> {
    SESSION_KEY_RE
        .captures(body)
        .map(|caps| caps[1].to_string())
}

pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

// ── Login response ────────────────────────────────────────────────────────────

/// Values of `<input name=...>` elements, in the order asked for.
/// Returns the first missing name on failure.
pub fn extract_hidden_fields(html: &str, names: &[&str]) -> Result<Vec<(String, String)>, String> {
    let doc = Html::parse_document(html);
    let mut fields = Vec::with_capacity(names.len());

    for name in names {
        let sel = Selector::parse(&format!("input[name=\"{}\"]", name))
            .map_err(|e| format!("{}: {:?}", name, e))?;
        let value = doc
            .select(&sel)
            .next()
            .and_then(|input| input.value().attr("value"))
            .ok_or_else(|| name.to_string())?;
        fields.push((name.to_string(), value.to_string()));
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_session_key() {
        let body = r#"<a href="/authenticationendpoint/login.do?client_id=x&sessionDataKey=9f1c-77ab-00&relyingParty=y">"#;
        assert_eq!(extract_session_key(body), Some("9f1c-77ab-00".to_string()));

        let escaped = "login.do?a=b&amp;sessionDataKey=abc-1";
        assert_eq!(extract_session_key(escaped), Some("abc-1".to_string()));

        assert_eq!(extract_session_key("<html>no key here</html>"), None);
        assert_eq!(extract_session_key("?sessionDataKey=abc"), None);
    }

    #[test]
    fn test_query_param() {
        let url = Url::parse(
            "https://login.example.com/oauth2/authorize?client_id=web&redirect_uri=https%3A%2F%2Fportal.example.com%2Fsignin",
        )
        .unwrap();
        assert_eq!(
            query_param(&url, "redirect_uri").as_deref(),
            Some("https://portal.example.com/signin")
        );
        assert_eq!(query_param(&url, "state"), None);
    }

    #[test]
    fn test_extract_hidden_fields() {
        let html = r#"<html><body><form method="post">
            <input type="hidden" name="code" value="c0de">
            <input type="hidden" name="id_token" value="tok">
            <input type="hidden" name="state" value="st">
            <input type="hidden" name="AuthenticatedIdPs" value="idp">
            <input type="hidden" name="session_state" value="ss">
        </form></body></html>"#;

        let fields = extract_hidden_fields(html, &LOGIN_FORM_FIELDS).unwrap();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[0], ("code".to_string(), "c0de".to_string()));
        assert_eq!(fields[3], ("AuthenticatedIdPs".to_string(), "idp".to_string()));
    }

    #[test]
    fn test_missing_hidden_field_is_named() {
        let html = r#"<form><input name="code" value="c"><input name="state" value="s"></form>"#;
        assert_eq!(
            extract_hidden_fields(html, &LOGIN_FORM_FIELDS),
            Err("id_token".to_string())
        );
    }
}
