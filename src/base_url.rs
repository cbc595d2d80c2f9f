//! Base URL derivation for dev servers.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;

use crate::error::BaseUrlError;
use crate::options::ServerOptions;

fn scheme_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^\w+://").expect("scheme pattern is valid"))
}

/// Computes the single URL tests should hit for a dev server.
///
/// A `public_host` wins over `host`/`port`. It is used verbatim when it
/// already carries a scheme, otherwise the scheme follows `ssl`. Either way
/// the result goes through `Url` so the stored form is canonical.
pub fn derive_base_url(options: &ServerOptions) -> Result<Url, BaseUrlError> {
    let scheme = if options.ssl { "https" } else { "http" };
    let raw = match &options.public_host {
        Some(public_host) if scheme_pattern().is_match(public_host) => public_host.clone(),
        Some(public_host) => format!("{}://{}", scheme, public_host),
        None => format!("{}://{}:{}", scheme, url_host(&options.host), options.port),
    };
    parse_base_url(&raw)
}

// IPv6 literals need brackets inside a URL authority.
fn url_host(host: &str) -> Cow<'_, str> {
    if host.contains(':') && !host.starts_with('[') {
        Cow::Owned(format!("[{}]", host))
    } else {
        Cow::Borrowed(host)
    }
}

/// Parses a user supplied URL into its canonical form.
pub fn parse_base_url(raw: &str) -> Result<Url, BaseUrlError> {
    Url::parse(raw).map_err(|err| BaseUrlError::Parse {
        url: raw.to_string(),
        message: err.to_string(),
    })
}
