use serde::Serialize;

/// A path with its identifiers abstracted, e.g. `/channels/{id}/messages`.
///
/// Rate limits and (by default) circuit state are keyed by this, not by the concrete path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RouteTemplate(String);

impl RouteTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Derive a template from a concrete endpoint (relative path or absolute URL).
    ///
    /// Query strings are dropped and purely numeric segments become `{id}`.
    pub fn from_endpoint(endpoint: &str) -> Self {
        let path = match url::Url::parse(endpoint) {
            Ok(u) => u.path().to_string(),
            Err(_) => endpoint
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        };

        let mut out = String::with_capacity(path.len());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            if segment.bytes().all(|b| b.is_ascii_digit()) {
                out.push_str("{id}");
            } else {
                out.push_str(segment);
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RouteTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments_are_abstracted() {
        let t = RouteTemplate::from_endpoint("/channels/80351110224678912/messages/175928847299117063");
        assert_eq!(t.as_str(), "/channels/{id}/messages/{id}");
    }

    #[test]
    fn test_query_and_absolute_urls() {
        assert_eq!(
            RouteTemplate::from_endpoint("/guilds/42/members?limit=100").as_str(),
            "/guilds/{id}/members"
        );
        assert_eq!(
            RouteTemplate::from_endpoint("https://cdn.example.com/avatars/7/abc.png").as_str(),
            "/avatars/{id}/abc.png"
        );
        assert_eq!(RouteTemplate::from_endpoint("").as_str(), "/");
    }

    #[test]
    fn test_same_template_for_different_ids() {
        assert_eq!(
            RouteTemplate::from_endpoint("/channels/1/messages"),
            RouteTemplate::from_endpoint("/channels/2/messages/")
        );
    }
}
