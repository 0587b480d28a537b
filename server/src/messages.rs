//! Canned replies, content-type mapping, and response header builders.

use {
    crate::alloc::PooledBuf,
    std::io::{Cursor, Write},
};

/// Identification header included in every built response.
pub const SERVER_STRING: &str = "Server: ringhook\r\n";

/// Complete responses (status line, headers, body) for the error paths.
/// Sent as-is from static storage; nothing to release.
pub const MALFORMED_REQUEST_MSG: &str = "HTTP/1.0 400 Bad Request\r\nContent-type: text/html\r\n\r\n<html><head><title>Malformed Request</title></head><body><h1>Bad Request</h1><p>Request could not be processed</p></body></html>";

pub const UNSUPPORTED_VERB_MSG: &str = "HTTP/1.0 400 Bad Request\r\nContent-type: text/html\r\n\r\n<html><head><title>Unsupported Operation Type</title></head><body><h1>Bad Request</h1><p>Hook requests must use a supported verb</p></body></html>";

pub const CONTENT_404_MSG: &str = "HTTP/1.0 404 Not Found\r\nContent-type: text/html\r\n\r\n<html><head><title>Resource Not Found</title></head><body><h1>Not Found (404)</h1><p>Request for an unknown resource</p></body></html>";

pub const INTERNAL_SERVER_ERROR_MSG: &str = "HTTP/1.0 500 Internal Server Error\r\nContent-type: text/html\r\n\r\n<html><head><title>Internal Server Error</title></head><body><h1>Internal Server Error (500)</h1><p>Request processing failed</p></body></html>";

/// Extension of `path`, empty when there is none (dotfiles included).
pub fn file_extension(path: &str) -> &str {
    match path.rfind('.') {
        Some(dot) if dot > 0 => &path[dot + 1..],
        _ => "",
    }
}

pub fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "Content-Type: image/jpeg\r\n",
        "png" => "Content-Type: image/png\r\n",
        "gif" => "Content-Type: image/gif\r\n",
        "html" => "Content-Type: text/html\r\n",
        "js" => "Content-Type: application/javascript\r\n",
        "css" => "Content-Type: text/css\r\n",
        "txt" => "Content-Type: text/plain\r\n",
        "json" => "Content-Type: application/json\r\n",
        _ => "Content-Type: application/octet-stream\r\n",
    }
}

/// Write `200 OK` headers for a file response into `buf`, deriving the
/// content type from the route's extension. Returns the header length.
pub fn build_file_headers(route: &str, contents_size: usize, buf: &mut PooledBuf) -> usize {
    write_headers(content_type_for(file_extension(route)), contents_size, buf)
}

/// Write `200 OK` headers for a dynamic (always JSON) response into `buf`.
pub fn build_dynamic_headers(contents_size: usize, buf: &mut PooledBuf) -> usize {
    write_headers("Content-Type: application/json\r\n", contents_size, buf)
}

fn write_headers(content_type: &str, contents_size: usize, buf: &mut PooledBuf) -> usize {
    let mut cursor = Cursor::new(buf.as_mut_slice());
    write!(
        cursor,
        "HTTP/1.0 200 OK\r\n{SERVER_STRING}{content_type}Content-Length: {contents_size}\r\n\r\n"
    )
    .expect("headers fit the header buffer");
    cursor.position() as usize
}
