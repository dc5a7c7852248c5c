//! Outgoing request rewriting
//!
//! Requests are forwarded byte for byte. Only the request line is touched,
//! and only when it carries an absolute-URI target: a destination that is
//! not a proxy expects origin-form (`/path`). Header edits are opt-in.

use std::borrow::Cow;

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;

/// Apply every rewrite the configuration asks for
pub fn prepare<'a>(
    request: &'a [u8],
    endpoint: &Endpoint,
    config: &ClientConfig,
) -> Cow<'a, [u8]> {
    let mut request = origin_form(request);

    if config.rewrite_host {
        request = Cow::Owned(set_header(&request, "Host", &endpoint.authority()));
    }
    if let Some(auth) = endpoint.authorization() {
        request = Cow::Owned(set_header(&request, "Authorization", auth));
    }

    request
}

/// Rewrite `GET http://host/path HTTP/1.0` to `GET /path HTTP/1.0`
///
/// Anything else, including requests without a recognizable request line,
/// is returned unchanged.
pub fn origin_form(request: &[u8]) -> Cow<'_, [u8]> {
    let line_end = match find(request, b"\n") {
        Some(pos) => pos,
        None => return Cow::Borrowed(request),
    };
    let line = trim_cr(&request[..line_end]);

    let mut parts = line.splitn(3, |&b| b == b' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Cow::Borrowed(request),
    };

    let path = match strip_scheme_and_host(target) {
        Some(path) => path,
        None => return Cow::Borrowed(request),
    };

    let mut out = Vec::with_capacity(request.len());
    out.extend_from_slice(method);
    out.push(b' ');
    if path.first() != Some(&b'/') {
        out.push(b'/');
    }
    out.extend_from_slice(path);
    out.push(b' ');
    out.extend_from_slice(version);
    out.extend_from_slice(&request[line.len()..]);
    Cow::Owned(out)
}

/// Request method, if the request line is readable
pub fn method(request: &[u8]) -> Option<&str> {
    let end = request.iter().position(|&b| b == b' ')?;
    std::str::from_utf8(&request[..end]).ok()
}

/// Build the GET that follows a redirect to `location`
///
/// Only the path and query of `location` are kept: the request always goes
/// to the configured destination. Absolute and network-path (`//host/path`)
/// references both lose their authority.
pub fn redirect_request(location: &str, endpoint: &Endpoint) -> Vec<u8> {
    let location = location.trim();
    let path = match location.strip_prefix("//") {
        Some(rest) => {
            let start = rest
                .find(|c: char| matches!(c, '/' | '?' | '#'))
                .unwrap_or(rest.len());
            &rest[start..]
        }
        None => strip_scheme_and_host(location.as_bytes())
            .and_then(|p| std::str::from_utf8(p).ok())
            .unwrap_or(location),
    };
    let path = path.split('#').next().unwrap_or_default();

    let mut request = String::from("GET ");
    if !path.starts_with('/') {
        request.push('/');
    }
    request.push_str(path);
    request.push_str(" HTTP/1.1\r\n");
    request.push_str(&format!("Host: {}\r\n", endpoint.authority()));
    if let Some(auth) = endpoint.authorization() {
        request.push_str(&format!("Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Insert or replace a header in the header block
pub fn set_header(request: &[u8], name: &str, value: &str) -> Vec<u8> {
    let line_end = match find(request, b"\n") {
        Some(pos) => pos + 1,
        None => return request.to_vec(),
    };
    let header = format!("{}: {}\r\n", name, value);

    let mut out = Vec::with_capacity(request.len() + header.len());
    out.extend_from_slice(&request[..line_end]);

    let mut pos = line_end;
    let mut replaced = false;
    loop {
        let end = match find(&request[pos..], b"\n") {
            Some(n) => pos + n + 1,
            None => request.len(),
        };
        let line = &request[pos..end];
        let line = trim_cr(line.strip_suffix(b"\n").unwrap_or(line));

        if line.is_empty() {
            // End of header block (or of the message)
            if !replaced {
                out.extend_from_slice(header.as_bytes());
            }
            out.extend_from_slice(&request[pos..]);
            return out;
        }

        if header_name_is(line, name) {
            if !replaced {
                out.extend_from_slice(header.as_bytes());
                replaced = true;
            }
        } else {
            out.extend_from_slice(&request[pos..end]);
        }
        pos = end;
    }
}

/// For an absolute-URI target returns what follows the authority
fn strip_scheme_and_host(target: &[u8]) -> Option<&[u8]> {
    let lower: Vec<u8> = target.iter().take(8).map(u8::to_ascii_lowercase).collect();
    let skip = if lower.starts_with(b"http://") {
        7
    } else if lower.starts_with(b"https://") {
        8
    } else {
        return None;
    };
    let rest = &target[skip..];
    let start = rest
        .iter()
        .position(|&b| b == b'/' || b == b'?')
        .unwrap_or(rest.len());
    Some(&rest[start..])
}

fn header_name_is(line: &[u8], name: &str) -> bool {
    match line.iter().position(|&b| b == b':') {
        Some(colon) => line[..colon].eq_ignore_ascii_case(name.as_bytes()),
        None => false,
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_uri_to_origin_form() {
        let req = b"GET http://foobar.com/path HTTP/1.0\r\nAccept: */*\r\n\r\n";
        let out = origin_form(req);
        assert_eq!(&out[..], &b"GET /path HTTP/1.0\r\nAccept: */*\r\n\r\n"[..]);
    }

    #[test]
    fn test_origin_form_untouched() {
        let req = b"POST /post HTTP/1.1\r\nContent-Length: 7\r\nHost: www.w3.org\r\n\r\na=1&b=2";
        assert!(matches!(origin_form(req), Cow::Borrowed(_)));
        assert_eq!(&origin_form(req)[..], &req[..]);
    }

    #[test]
    fn test_absolute_uri_without_path() {
        assert_eq!(
            &origin_form(b"GET http://foobar.com HTTP/1.0\r\n\r\n")[..],
            &b"GET / HTTP/1.0\r\n\r\n"[..]
        );
        assert_eq!(
            &origin_form(b"GET HTTPS://foobar.com:8443?q=1 HTTP/1.1\r\n\r\n")[..],
            &b"GET /?q=1 HTTP/1.1\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_body_preserved() {
        let req = b"POST http://h/p?x=1 HTTP/1.0\r\nContent-Length: 3\r\n\r\nGET http://a/b";
        let out = origin_form(req);
        let expected = b"POST /p?x=1 HTTP/1.0\r\nContent-Length: 3\r\n\r\nGET http://a/b";
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn test_other_forms_pass_through() {
        let star = b"OPTIONS * HTTP/1.1\r\n\r\n";
        assert_eq!(&origin_form(star)[..], &star[..]);
        let connect = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        assert_eq!(&origin_form(connect)[..], &connect[..]);
        assert_eq!(&origin_form(b"garbage")[..], b"garbage");
    }

    #[test]
    fn test_method() {
        assert_eq!(method(b"HEAD / HTTP/1.1\r\n\r\n"), Some("HEAD"));
        assert_eq!(method(b""), None);
    }

    #[test]
    fn test_set_header_replaces() {
        let req = b"GET / HTTP/1.1\r\nhost: old\r\nAccept: */*\r\n\r\nbody";
        let out = set_header(req, "Host", "new:80");
        assert_eq!(&out[..], &b"GET / HTTP/1.1\r\nHost: new:80\r\nAccept: */*\r\n\r\nbody"[..]);
    }

    #[test]
    fn test_set_header_inserts() {
        let out = set_header(b"GET / HTTP/1.1\r\n\r\n", "Authorization", "Basic xyz");
        assert_eq!(&out[..], &b"GET / HTTP/1.1\r\nAuthorization: Basic xyz\r\n\r\n"[..]);
    }

    #[test]
    fn test_prepare_with_auth_and_host() {
        let endpoint = Endpoint::resolve("http://u:p@replay.local:8080");
        let config = ClientConfig { rewrite_host: true, ..Default::default() };
        let req = b"GET http://orig.com/a HTTP/1.0\r\nHost: orig.com\r\n\r\n";
        let out = prepare(req, &endpoint, &config);
        let text = String::from_utf8(out.into_owned()).unwrap();
        assert!(text.starts_with("GET /a HTTP/1.0\r\n"));
        assert!(text.contains("Host: replay.local:8080\r\n"));
        assert!(text.contains("Authorization: Basic dTpw\r\n"));
        assert!(!text.contains("orig.com"));
    }

    #[test]
    fn test_redirect_request() {
        let endpoint = Endpoint::resolve("127.0.0.1:9000");
        let req = redirect_request("http://elsewhere.com/new?x=1#frag", &endpoint);
        assert_eq!(&req[..], &b"GET /new?x=1 HTTP/1.1\r\nHost: 127.0.0.1:9000\r\n\r\n"[..]);

        let relative = redirect_request("/r1", &endpoint);
        assert!(relative.starts_with(b"GET /r1 HTTP/1.1\r\n"));

        let network_path = redirect_request("//other.example/x?y=1", &endpoint);
        assert!(network_path.starts_with(b"GET /x?y=1 HTTP/1.1\r\n"));
        let bare_host = redirect_request("//other.example", &endpoint);
        assert!(bare_host.starts_with(b"GET / HTTP/1.1\r\n"));
        let query_only = redirect_request("//other.example?q=2#top", &endpoint);
        assert!(query_only.starts_with(b"GET /?q=2 HTTP/1.1\r\n"));
    }
}
