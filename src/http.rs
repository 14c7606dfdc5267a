use std::collections::HashMap;

/// Upper bound for the request line plus headers.
const MAX_HEAD_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GET,
    POST,
    OTHER(String),
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            _ => Method::OTHER(s.to_string()),
        }
    }
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::OTHER(s) => s,
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    /// Keys are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new() -> Self {
        Request {
            method: Method::GET,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    Done,
    Error,
    TooLarge,
}

/// Incremental HTTP/1.x request parser fed straight from the socket.
pub struct Parser {
    pub state: ParseState,
    pub request: Request,
    buffer: Vec<u8>,
    chunk_size: usize,
    content_length: usize,
    max_body_size: usize,
}

impl Parser {
    pub fn new(max_body_size: usize) -> Self {
        Parser {
            state: ParseState::RequestLine,
            request: Request::new(),
            buffer: Vec::new(),
            chunk_size: 0,
            content_length: 0,
            max_body_size,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ParseState::Done | ParseState::Error | ParseState::TooLarge)
    }

    /// Hands the parsed request over, leaving an empty one behind.
    pub fn take_request(&mut self) -> Request {
        std::mem::take(&mut self.request)
    }

    pub fn parse(&mut self, data: &[u8]) {
        if self.is_finished() {
            return;
        }
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ParseState::RequestLine => {
                    if let Some(pos) = find_crlf(&self.buffer) {
                        let line = String::from_utf8_lossy(&self.buffer[..pos]);
                        let parts: Vec<&str> = line.split_whitespace().collect();
                        if parts.len() == 3 && parts[2].starts_with("HTTP/1.") {
                            self.request.method = Method::from(parts[0]);
                            self.request.path = parts[1].to_string();
                            self.request.version = parts[2].to_string();
                            self.state = ParseState::Headers;
                            self.buffer.drain(..pos + 2);
                        } else {
                            self.state = ParseState::Error;
                            return;
                        }
                    } else {
                        self.check_head_size();
                        break;
                    }
                }
                ParseState::Headers => {
                    if let Some(pos) = find_crlf(&self.buffer) {
                        if pos == 0 {
                            self.buffer.drain(..2);
                            self.start_body();
                            if self.is_finished() {
                                return;
                            }
                        } else {
                            let line = String::from_utf8_lossy(&self.buffer[..pos]);
                            if let Some(colon) = line.find(':') {
                                let key = line[..colon].trim().to_ascii_lowercase();
                                let value = line[colon + 1..].trim().to_string();
                                self.request.headers.insert(key, value);
                            } else {
                                self.state = ParseState::Error;
                                return;
                            }
                            self.buffer.drain(..pos + 2);
                        }
                    } else {
                        self.check_head_size();
                        break;
                    }
                }
                ParseState::Body => {
                    if self.buffer.len() >= self.content_length {
                        self.request.body = self.buffer.drain(..self.content_length).collect();
                        self.state = ParseState::Done;
                    } else {
                        break;
                    }
                }
                ParseState::ChunkSize => {
                    if let Some(pos) = find_crlf(&self.buffer) {
                        let line = String::from_utf8_lossy(&self.buffer[..pos]);
                        // Chunk extensions follow a ';' and carry nothing we use.
                        let size = line.split(';').next().unwrap_or_default().trim();
                        if let Ok(size) = usize::from_str_radix(size, 16) {
                            if self.request.body.len().saturating_add(size) > self.max_body_size {
                                self.state = ParseState::TooLarge;
                                return;
                            }
                            self.chunk_size = size;
                            self.buffer.drain(..pos + 2);
                            if size == 0 {
                                self.state = ParseState::ChunkTrailer;
                            } else {
                                self.state = ParseState::ChunkData;
                            }
                        } else {
                            self.state = ParseState::Error;
                            return;
                        }
                    } else {
                        break;
                    }
                }
                ParseState::ChunkData => {
                    if self.buffer.len() >= self.chunk_size + 2 {
                        self.request.body.extend_from_slice(&self.buffer[..self.chunk_size]);
                        self.buffer.drain(..self.chunk_size + 2);
                        self.state = ParseState::ChunkSize;
                    } else {
                        break;
                    }
                }
                ParseState::ChunkTrailer => {
                    if let Some(pos) = find_crlf(&self.buffer) {
                        if pos == 0 {
                            self.buffer.drain(..2);
                            self.state = ParseState::Done;
                        } else {
                            self.buffer.drain(..pos + 2);
                        }
                    } else {
                        break;
                    }
                }
                ParseState::Done | ParseState::Error | ParseState::TooLarge => break,
            }
        }
    }

    fn start_body(&mut self) {
        if let Some(te) = self.request.header("transfer-encoding") {
            if te.eq_ignore_ascii_case("chunked") {
                self.state = ParseState::ChunkSize;
            } else {
                self.state = ParseState::Error;
            }
        } else if let Some(len_str) = self.request.header("content-length") {
            match len_str.parse::<usize>() {
                Ok(len) if len > self.max_body_size => self.state = ParseState::TooLarge,
                Ok(0) => self.state = ParseState::Done,
                Ok(len) => {
                    self.content_length = len;
                    self.state = ParseState::Body;
                }
                Err(_) => self.state = ParseState::Error,
            }
        } else {
            self.state = ParseState::Done;
        }
    }

    fn check_head_size(&mut self) {
        if self.buffer.len() > MAX_HEAD_SIZE {
            self.state = ParseState::Error;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Decodes `%XX` escapes. Returns `None` on a malformed escape or when the
/// decoded bytes are not UTF-8.
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

pub struct Response {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Response {
            status_code,
            headers: vec![("Server".to_string(), "ScriptGateway/0.1.0".to_string())],
            body: Vec::new(),
        }
    }

    pub fn header(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// Head of a streamed script response. The body follows in `framing`.
    pub fn streaming(framing: Framing, script_name: &str) -> Self {
        let mut res = Response::new(200);
        res.header("Content-Type", "application/octet-stream")
            .header("X-Script-Name", script_name)
            .header("Connection", "close");
        if framing == Framing::Chunked {
            res.header("Transfer-Encoding", "chunked")
                .header("Trailer", EXIT_CODE_TRAILER);
        }
        res
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut resp = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status_code,
            reason_phrase(self.status_code)
        )
        .into_bytes();
        for (key, value) in &self.headers {
            resp.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        resp.extend_from_slice(b"\r\n");
        resp.extend_from_slice(&self.body);
        resp
    }
}

pub const EXIT_CODE_TRAILER: &str = "X-Script-Exit-Code";

/// How a streamed body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// HTTP/1.1 chunked transfer coding; a missing last-chunk marks truncation.
    Chunked,
    /// HTTP/1.0: the body runs until the connection closes.
    CloseDelimited,
}

impl Framing {
    pub fn for_version(version: &str) -> Self {
        if version == "HTTP/1.0" {
            Framing::CloseDelimited
        } else {
            Framing::Chunked
        }
    }

    pub fn encode_chunk(self, out: &mut Vec<u8>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self {
            Framing::Chunked => {
                out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Framing::CloseDelimited => out.extend_from_slice(data),
        }
    }

    /// Writes the end-of-body marker carrying the script's exit code.
    pub fn encode_end(self, out: &mut Vec<u8>, exit_code: Option<i32>) {
        if self == Framing::Chunked {
            out.extend_from_slice(b"0\r\n");
            if let Some(code) = exit_code {
                out.extend_from_slice(format!("{}: {}\r\n", EXIT_CODE_TRAILER, code).as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
    }
}
