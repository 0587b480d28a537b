//! End-to-end tests: a live server on an ephemeral port, driven with plain
//! blocking sockets. The server closes each connection after its response,
//! so a client reads to EOF.

use {
    rand::Rng,
    ringhook_server::server::{HookServer, ServerConfig},
    std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
    tempfile::TempDir,
};

const SAMPLE_JSON: &[u8] = br#"{"sample":true,"values":[1,2,3]}"#;

struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<std::io::Result<()>>>,
    _static_dir: TempDir,
}

impl TestServer {
    fn start() -> Self {
        let static_dir = tempfile::tempdir().unwrap();
        std::fs::write(static_dir.path().join("sample.json"), SAMPLE_JSON).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ServerConfig {
            static_root: static_dir.path().to_str().unwrap().to_string(),
            ..ServerConfig::default()
        };
        let server = HookServer::new(listener, config).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("testHookSrv".to_string())
            .spawn(move || server.run(&flag))
            .unwrap();

        Self {
            port,
            shutdown,
            handle: Some(handle),
            _static_dir: static_dir,
        }
    }

    fn connect(&self) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", self.port)) {
                Ok(stream) => return stream,
                Err(err) => {
                    assert!(Instant::now() < deadline, "could not connect: {err}");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn send(&self, raw: &[u8]) -> String {
        let mut stream = self.connect();
        stream.write_all(raw).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        String::from_utf8(response).unwrap()
    }

    fn get(&self, path: &str) -> String {
        self.send(format!("GET {path} HTTP/1.0\r\nHost: localhost\r\n\r\n").as_bytes())
    }

    fn get_with_body(&self, path: &str, body: &str) -> String {
        self.send(
            format!(
                "GET {path} HTTP/1.0\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )
            .as_bytes(),
        )
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

fn body_of(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

#[test]
fn test_hello_route() {
    let server = TestServer::start();
    let response = server.get("/hello");
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.contains("Server: ringhook\r\n"));
    assert!(response.contains("Content-Type: application/json\r\n"));
    assert!(response.contains("Content-Length: 27\r\n"));
    assert_eq!(body_of(&response), r#"{"message":"Hello, world!"}"#);
}

#[test]
fn test_helloname_route() {
    let server = TestServer::start();
    let response = server.get_with_body("/helloname", r#"{"name":"Ada"}"#);
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    let body = body_of(&response);
    assert_eq!(body, r#"{"message":"Hello, Ada!"}"#);
    assert!(response.contains(&format!("Content-Length: {}\r\n", body.len())));
}

#[test]
fn test_helloname_without_body_is_rejected() {
    let server = TestServer::start();
    let response = server.get("/helloname");
    assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{response}");
}

#[test]
fn test_sample_json_served_and_memoized() {
    let server = TestServer::start();

    let first = server.get("/sample.json");
    assert!(first.starts_with("HTTP/1.0 200 OK\r\n"), "{first}");
    assert!(first.contains("Content-Type: application/json\r\n"));
    assert_eq!(body_of(&first).as_bytes(), SAMPLE_JSON);

    // Second request is served from the cache with an identical body.
    let second = server.get("/sample.json");
    assert_eq!(first, second);
}

#[test]
fn test_unsupported_verb() {
    let server = TestServer::start();
    let response = server.send(b"POST /hello HTTP/1.0\r\nHost: localhost\r\n\r\n");
    assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("supported verb"));
}

#[test]
fn test_unknown_route_is_404() {
    let server = TestServer::start();
    let response = server.get("/nope");
    assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"), "{response}");
}

#[test]
fn test_malformed_request() {
    let server = TestServer::start();
    let response = server.send(b"complete-nonsense\r\n\r\n");
    assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{response}");
}

#[test]
fn test_fib_job_with_interleaved_hello() {
    let server = TestServer::start();

    // Kick off the compute request, then complete a full round trip on a
    // second connection while the job is outstanding.
    let mut fib = server.connect();
    let body = r#"{"value":35}"#;
    fib.write_all(
        format!(
            "GET /fib HTTP/1.0\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .as_bytes(),
    )
    .unwrap();

    let hello = server.get("/hello");
    assert!(hello.starts_with("HTTP/1.0 200 OK\r\n"));

    let mut response = Vec::new();
    fib.read_to_end(&mut response).unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Type: application/json\r\n"));
    assert_eq!(body_of(&response), r#"{"result":9227465}"#);
}

#[test]
fn test_fib_small_value() {
    let server = TestServer::start();
    let response = server.get_with_body("/fib", r#"{"value":10}"#);
    assert_eq!(body_of(&response), r#"{"result":55}"#);
}

#[test]
fn test_fib_rejects_oversized_input() {
    let server = TestServer::start();
    let response = server.get_with_body("/fib", r#"{"value":93}"#);
    assert!(response.starts_with("HTTP/1.0 400 Bad Request\r\n"), "{response}");
}

#[test]
fn test_survives_random_garbage() {
    let server = TestServer::start();
    let mut rng = rand::rng();

    for _ in 0..32 {
        let len = rng.random_range(1..512);
        let mut junk: Vec<u8> = (0..len).map(|_| rng.random_range(1..=255)).collect();
        junk.extend_from_slice(b"\r\n\r\n");
        // Every reply is one of the canned errors (or, for byte soup that
        // happens to parse, a routed response); the server must not wedge.
        let response = server.send(&junk);
        assert!(response.starts_with("HTTP/1.0 "), "{response:?}");
    }

    let response = server.get("/hello");
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
}

#[test]
fn test_connection_closed_after_response() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /hello HTTP/1.0\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut response = Vec::new();
    // read_to_end only returns if the server closes its end.
    stream.read_to_end(&mut response).unwrap();
    assert!(!response.is_empty());
    // A second read observes a clean EOF.
    assert_eq!(stream.read(&mut [0u8; 16]).unwrap(), 0);
}

#[test]
fn test_clean_shutdown_with_idle_server() {
    let server = TestServer::start();
    let response = server.get("/hello");
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
    // Drop triggers the shutdown path and asserts run() returned Ok.
}
