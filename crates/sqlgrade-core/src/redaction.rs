use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

const REDACTED: &str = "[REDACTED]";

fn absolute_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:[A-Za-z]:\\|/)(?:[\w.\-]+[/\\])+[\w.\-]*"#)
            .expect("static path pattern")
    })
}

fn object_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:s3|gs|https?)://[^\s'"]+"#).expect("static url pattern"))
}

/// Scrubs storage locations and host paths from text shown to learners.
///
/// Known secrets (bucket names, object keys, scratch paths) are registered
/// explicitly; absolute paths and object URLs are caught by pattern.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, s: impl Into<String>) -> Self {
        self.add_secret(s);
        self
    }

    pub fn add_secret(&mut self, s: impl Into<String>) {
        let s = s.into();
        // Very short tokens would shred ordinary words in messages.
        if s.len() >= 3 && !self.secrets.contains(&s) {
            self.secrets.push(s);
            self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        }
    }

    pub fn redact<'a>(&self, s: &'a str) -> Cow<'a, str> {
        let mut out: Cow<'a, str> = Cow::Borrowed(s);
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = Cow::Owned(out.replace(secret.as_str(), REDACTED));
            }
        }
        if object_url_re().is_match(&out) {
            out = Cow::Owned(object_url_re().replace_all(&out, REDACTED).into_owned());
        }
        if absolute_path_re().is_match(&out) {
            out = Cow::Owned(absolute_path_re().replace_all(&out, REDACTED).into_owned());
        }
        out
    }
}
