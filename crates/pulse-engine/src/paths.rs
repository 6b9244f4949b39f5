use pulse_core::event::Event;

/// Normalizes a page URL or path to a comparable path: scheme and host,
/// query string and fragment are dropped, trailing slashes trimmed and the
/// result lower-cased. An empty input stays empty.
pub fn normalize_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let path = match url::Url::parse(trimmed) {
        Ok(parsed) if parsed.has_host() => parsed.path().to_string(),
        _ => {
            let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
            without_fragment
                .split('?')
                .next()
                .unwrap_or(without_fragment)
                .trim()
                .to_string()
        }
    };

    let mut normalized = path;
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized.to_lowercase()
    }
}

/// Normalized path of a pageview, `None` for custom events or pageviews
/// without a URL.
pub fn pageview_path(event: &Event) -> Option<String> {
    if !event.is_pageview() {
        return None;
    }
    event
        .page_url
        .as_deref()
        .map(normalize_path)
        .filter(|p| !p.is_empty())
}

/// Label of an event inside a journey: the page path for pageviews, the
/// event name otherwise.
pub fn journey_label(event: &Event) -> Option<String> {
    if event.is_pageview() {
        pageview_path(event)
    } else if event.name.trim().is_empty() {
        None
    } else {
        Some(event.name.clone())
    }
}
