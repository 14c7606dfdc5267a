//! Test harness for gateway integration tests.
//!
//! Starts a gateway on an ephemeral port in a background thread, with a
//! temporary script root whose scripts are run by `/bin/sh`.

#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use script_gateway::{Config, Server};
use tempfile::TempDir;

pub const READ_TIMEOUT: Duration = Duration::from_secs(20);

pub struct TestGateway {
    pub addr: SocketAddr,
    /// Scratch space outside the script root.
    pub dir: TempDir,
    pub root: PathBuf,
}

impl TestGateway {
    pub fn start() -> Self {
        Self::start_with(&[])
    }

    /// Starts a gateway; `overrides` replace or extend the default settings
    /// of the single server block.
    pub fn start_with(overrides: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let root = dir.path().join("scripts");
        fs::create_dir(&root).expect("create script root");

        let root_str = root.display().to_string();
        let mut settings: Vec<(&str, &str)> = vec![
            ("host", "127.0.0.1"),
            ("ports", "[0]"),
            ("script_root", root_str.as_str()),
            ("extension", ".sh"),
            ("interpreter", "/bin/sh"),
            ("timeout_secs", "30"),
            ("stderr", "discard"),
        ];
        for (key, value) in overrides {
            match settings.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value,
                None => settings.push((key, value)),
            }
        }

        let mut yaml = String::from("servers:\n");
        for (i, (key, value)) in settings.iter().enumerate() {
            let lead = if i == 0 { "  - " } else { "    " };
            yaml.push_str(&format!("{}{}: {}\n", lead, key, value));
        }

        let config = Config::from_yaml(&yaml).expect("valid test config");
        let mut server = Server::new(config).expect("start gateway");
        let addr = server.local_addrs()[0];
        thread::spawn(move || {
            let _ = server.run();
        });

        TestGateway { addr, dir, root }
    }

    /// Writes `<root>/<name>.sh`.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.root.join(format!("{}.sh", name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create script dir");
        }
        fs::write(&path, body).expect("write script");
        path
    }

    /// Path inside the scratch dir, outside the script root.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn send(&self, raw: &[u8]) -> TcpStream {
        let mut stream = TcpStream::connect(self.addr).expect("connect to gateway");
        stream.set_read_timeout(Some(READ_TIMEOUT)).expect("set read timeout");
        stream.write_all(raw).expect("send request");
        stream
    }

    pub fn post(&self, path: &str, body: Option<&str>) -> HttpResponse {
        let mut stream = self.send(&request("POST", path, "HTTP/1.1", body));
        read_response(&mut stream)
    }
}

pub fn request(method: &str, path: &str, version: &str, body: Option<&str>) -> Vec<u8> {
    let mut raw = format!("{} {} {}\r\nHost: localhost\r\n", method, path, version);
    if let Some(body) = body {
        raw.push_str(&format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ));
    } else {
        raw.push_str("\r\n");
    }
    raw.into_bytes()
}

/// Writes an executable helper script (not under the script root).
pub fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).expect("write executable");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub trailers: Vec<(String, String)>,
    /// False when a chunked body ended without its last-chunk.
    pub complete: bool,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_field(&self.headers, name)
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        find_field(&self.trailers, name)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Reads until the server closes the connection and decodes what arrived.
pub fn read_response(stream: &mut TcpStream) -> HttpResponse {
    let mut raw = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // A reset still leaves whatever arrived before it.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) => panic!("reading response: {}", e),
        }
    }
    decode(&raw)
}

fn decode(raw: &[u8]) -> HttpResponse {
    let head_end = find(raw, b"\r\n\r\n").expect("response head");
    let (status, headers) = parse_head(&String::from_utf8_lossy(&raw[..head_end]));
    let rest = &raw[head_end + 4..];

    let chunked = find_field(&headers, "Transfer-Encoding") == Some("chunked");
    let (body, trailers, complete) = if chunked {
        decode_chunked(rest)
    } else {
        (rest.to_vec(), Vec::new(), true)
    };

    HttpResponse {
        status,
        headers,
        body,
        trailers,
        complete,
    }
}

fn parse_head(head: &str) -> (u16, Vec<(String, String)>) {
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let headers = lines.filter_map(parse_field).collect();
    (status, headers)
}

fn parse_field(line: &str) -> Option<(String, String)> {
    line.split_once(':')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
}

fn decode_chunked(mut rest: &[u8]) -> (Vec<u8>, Vec<(String, String)>, bool) {
    let mut body = Vec::new();
    loop {
        let Some(line_end) = find(rest, b"\r\n") else {
            return (body, Vec::new(), false);
        };
        let size_line = String::from_utf8_lossy(&rest[..line_end]).into_owned();
        let size = usize::from_str_radix(size_line.trim(), 16).expect("chunk size");
        rest = &rest[line_end + 2..];

        if size == 0 {
            let mut trailers = Vec::new();
            loop {
                let Some(end) = find(rest, b"\r\n") else {
                    return (body, trailers, false);
                };
                if end == 0 {
                    return (body, trailers, true);
                }
                if let Some(field) = parse_field(&String::from_utf8_lossy(&rest[..end])) {
                    trailers.push(field);
                }
                rest = &rest[end + 2..];
            }
        }

        if rest.len() < size + 2 {
            body.extend_from_slice(&rest[..rest.len().min(size)]);
            return (body, Vec::new(), false);
        }
        body.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Incremental reader for observing a chunked stream as it arrives.
pub struct StreamReader {
    reader: BufReader<TcpStream>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl StreamReader {
    pub fn open(stream: TcpStream) -> Self {
        let mut reader = BufReader::new(stream);
        let mut head = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).expect("read head line");
            if line == "\r\n" || line.is_empty() {
                break;
            }
            head.push_str(&line);
        }
        let (status, headers) = parse_head(head.trim_end());
        StreamReader {
            reader,
            status,
            headers,
        }
    }

    /// Next chunk's payload, or `None` at the last-chunk.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let mut size_line = String::new();
        self.reader.read_line(&mut size_line).expect("read chunk size");
        let size = usize::from_str_radix(size_line.trim(), 16).expect("chunk size");
        if size == 0 {
            return None;
        }
        let mut data = vec![0u8; size + 2];
        self.reader.read_exact(&mut data).expect("read chunk");
        data.truncate(size);
        Some(data)
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
