//! Minimal HTTP/1.0 request extraction.
//!
//! Deliberately a request-line/Content-Length extractor, not a general
//! parser: method up to the first space, path between `" /"` and the next
//! space, body delimited by a literal `Content-Length: ` header after the
//! blank line. Anything outside that contract is malformed.

const CONTENT_LENGTH: &[u8] = b"Content-Length: ";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// The pieces of a request the router cares about.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: &'a [u8],
    pub path: &'a str,
    /// Present only when a `Content-Length` header announced a body and the
    /// buffer holds all of it.
    pub body: Option<&'a [u8]>,
}

pub fn is_get(method: &[u8]) -> bool {
    method.eq_ignore_ascii_case(b"get")
}

/// Extract method, path and body from a raw request buffer.
pub fn parse(raw: &[u8]) -> Option<Request<'_>> {
    let method_end = raw.iter().position(|&b| b == b' ')?;
    let method = &raw[..method_end];
    if method.is_empty() {
        return None;
    }

    let after_method = &raw[method_end..];
    let path_start = find(after_method, b" /")? + 1;
    let path_raw = &after_method[path_start..];
    let path_end = path_raw.iter().position(|&b| b == b' ')?;
    let path = std::str::from_utf8(&path_raw[..path_end]).ok()?;

    Some(Request {
        method,
        path,
        body: parse_body(raw),
    })
}

fn parse_body(raw: &[u8]) -> Option<&[u8]> {
    let header_at = find(raw, CONTENT_LENGTH)?;
    let digits = &raw[header_at + CONTENT_LENGTH.len()..];
    let digits_end = digits.iter().position(|b| !b.is_ascii_digit())?;
    let length: usize = std::str::from_utf8(&digits[..digits_end])
        .ok()?
        .parse()
        .ok()?;

    let body_start = find(raw, HEADER_TERMINATOR)? + HEADER_TERMINATOR.len();
    raw.get(body_start..body_start + length)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_parses_bodyless_get() {
        let raw = b"GET /hello HTTP/1.0\r\nHost: localhost\r\n\r\n";
        let request = parse(raw).unwrap();
        assert_eq!(request.method, b"GET");
        assert_eq!(request.path, "/hello");
        assert!(request.body.is_none());
    }

    #[test]
    fn test_parses_body_with_content_length() {
        let raw =
            b"GET /helloname HTTP/1.0\r\nContent-Length: 14\r\n\r\n{\"name\":\"Ada\"}";
        let request = parse(raw).unwrap();
        assert_eq!(request.path, "/helloname");
        assert_eq!(request.body.unwrap(), br#"{"name":"Ada"}"#);
    }

    #[test]
    fn test_truncated_body_is_dropped() {
        let raw = b"GET /helloname HTTP/1.0\r\nContent-Length: 50\r\n\r\n{\"name\":";
        let request = parse(raw).unwrap();
        assert!(request.body.is_none());
    }

    #[test]
    fn test_body_length_is_honored() {
        // Trailing bytes beyond the announced length are not part of the body.
        let raw = b"GET /x HTTP/1.0\r\nContent-Length: 2\r\n\r\nabJUNK";
        let request = parse(raw).unwrap();
        assert_eq!(request.body.unwrap(), b"ab");
    }

    #[test]
    fn test_post_is_not_get() {
        let raw = b"POST /hello HTTP/1.0\r\n\r\n";
        let request = parse(raw).unwrap();
        assert_eq!(request.method, b"POST");
        assert!(!is_get(request.method));
    }

    #[test]
    fn test_method_match_ignores_case() {
        assert!(is_get(b"GET"));
        assert!(is_get(b"get"));
        assert!(is_get(b"GeT"));
        assert!(!is_get(b"GETX"));
    }

    #[test]
    fn test_path_is_borrowed_verbatim() {
        let raw = b"GET /a/b/c.json HTTP/1.0\r\n\r\n";
        assert_matches!(parse(raw), Some(Request { path: "/a/b/c.json", body: None, .. }));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse(b"").is_none());
        assert!(parse(b"no-spaces-here").is_none());
        assert!(parse(b"GET\r\n\r\n").is_none());
        // Path missing the leading slash.
        assert!(parse(b"GET hello HTTP/1.0\r\n\r\n").is_none());
        // Request line never terminated.
        assert!(parse(b"GET /hello").is_none());
    }
}
