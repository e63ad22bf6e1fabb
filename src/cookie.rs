use std::{collections::HashMap, time::SystemTime};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tracing::debug;

// cookie-octet excludes controls, whitespace, dquote, comma, semicolon, backslash.
const COOKIE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'\\')
    .add(b'%')
    .add(b'=');

/// Parse a `Cookie` request header. Pairs are split on `;`, each pair on the
/// first `=`; key and value are percent-decoded. Malformed pairs are dropped
/// without failing the request.
pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            debug!(target: "parse", "dropping malformed cookie pair: {pair:?}");
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            debug!(target: "parse", "dropping cookie pair with empty name");
            continue;
        }
        match (
            percent_decode_str(key).decode_utf8(),
            percent_decode_str(value).decode_utf8(),
        ) {
            (Ok(k), Ok(v)) => {
                cookies.insert(k.into_owned(), v.into_owned());
            }
            _ => debug!(target: "parse", "dropping undecodable cookie pair: {pair:?}"),
        }
    }
    cookies
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    /// normalize arbitrary-case input, defaulting to lax.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("strict") {
            Self::Strict
        } else if value.eq_ignore_ascii_case("none") {
            Self::None
        } else {
            Self::Lax
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Secure {
    No,
    Yes,
    /// emit `Secure` only when the request arrived over tls.
    Auto,
}

/// Builder for a `Set-Cookie` response header.
#[derive(Clone, Debug)]
pub struct SetCookie {
    name: String,
    value: String,
    max_age: Option<i64>,
    expires: Option<SystemTime>,
    domain: Option<String>,
    path: String,
    secure: Secure,
    http_only: bool,
    same_site: SameSite,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            max_age: None,
            expires: None,
            domain: None,
            path: String::from("/"),
            secure: Secure::No,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }

    pub fn max_age(mut self, secs: i64) -> Self {
        self.max_age = Some(secs);
        self
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn secure(mut self, secure: Secure) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, on: bool) -> Self {
        self.http_only = on;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// serialize to header value form. `is_tls` resolves [Secure::Auto].
    pub fn serialize(&self, is_tls: bool) -> String {
        let mut out = format!(
            "{}={}",
            utf8_percent_encode(&self.name, COOKIE_SET),
            utf8_percent_encode(&self.value, COOKIE_SET)
        );
        if let Some(max_age) = self.max_age {
            out.push_str("; Max-Age=");
            out.push_str(itoa::Buffer::new().format(max_age));
        }
        if let Some(expires) = self.expires {
            out.push_str("; Expires=");
            out.push_str(&httpdate::fmt_http_date(expires));
        }
        if let Some(ref domain) = self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        out.push_str("; Path=");
        out.push_str(&self.path);
        let secure = match self.secure {
            Secure::Yes => true,
            Secure::Auto => is_tls,
            Secure::No => false,
        };
        if secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out.push_str("; SameSite=");
        out.push_str(self.same_site.as_str());
        out
    }
}
