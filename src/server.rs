use crate::config::Config;
use crate::error::{generate_error_response, GatewayError, ServerError};
use crate::http::{Framing, ParseState, Parser, Request};
use crate::relay::{Ending, Pump, Relay};
use crate::router::{Dispatch, Router};
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use nix::libc;
use nix::sys::socket::{setsockopt, sockopt};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Connections that never finish a request are dropped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while any script is running; exit status is checked on it.
const TICK: Duration = Duration::from_millis(50);
const IDLE_TICK: Duration = Duration::from_secs(1);
/// Pipe reads pause while this much output is queued for a slow client.
const HIGH_WATER: usize = 256 * 1024;

pub struct Server {
    poll: Poll,
    listeners: Vec<(TcpListener, usize)>,
    routers: Vec<Router>,
    connections: HashMap<Token, Connection>,
    /// Child stdout token -> owning connection token.
    pipes: HashMap<Token, Token>,
    next_token: usize,
}

struct Connection {
    token: Token,
    pipe_token: Token,
    socket: TcpStream,
    router: usize,
    parser: Parser,
    response_buf: Vec<u8>,
    relay: Option<Relay>,
    dispatched: bool,
    backlogged: bool,
    is_closing: bool,
    /// Close with a reset instead of a FIN.
    abortive: bool,
    hung_up: bool,
    last_activity: Instant,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let poll = Poll::new()?;
        let mut listeners = Vec::new();
        let mut routers = Vec::new();

        for server_cfg in &config.servers {
            let router = Router::new(server_cfg)?;
            for port in &server_cfg.ports {
                let addr_str = format!("{}:{}", server_cfg.host, port);
                let addr = addr_str
                    .to_socket_addrs()
                    .and_then(|mut addrs| {
                        addrs
                            .next()
                            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address"))
                    })
                    .map_err(|source| ServerError::Bind {
                        addr: addr_str.clone(),
                        source,
                    })?;

                let mut listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
                    addr: addr_str.clone(),
                    source,
                })?;
                let token = Token(listeners.len());

                poll.registry().register(&mut listener, token, Interest::READABLE)?;
                info!(
                    "Listening on {} for scripts under {}",
                    listener.local_addr()?,
                    router.script_root().display()
                );
                listeners.push((listener, routers.len()));
            }
            routers.push(router);
        }

        let next_token = listeners.len();
        Ok(Server {
            poll,
            listeners,
            routers,
            connections: HashMap::new(),
            pipes: HashMap::new(),
            next_token,
        })
    }

    /// Bound addresses, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(listener, _)| listener.local_addr().ok())
            .collect()
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            let timeout = if self.connections.values().any(|c| c.relay.is_some()) {
                TICK
            } else {
                IDLE_TICK
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                let token = event.token();

                if token.0 < self.listeners.len() {
                    self.accept(token.0);
                } else if let Some(&conn_token) = self.pipes.get(&token) {
                    self.on_output(conn_token);
                } else {
                    self.on_socket(token, event.is_readable() || event.is_read_closed());
                }
            }

            self.tick();
            self.sweep();
        }
    }

    fn accept(&mut self, index: usize) {
        loop {
            match self.listeners[index].0.accept() {
                Ok((mut socket, peer)) => {
                    let token = Token(self.next_token);
                    let pipe_token = Token(self.next_token + 1);
                    self.next_token += 2;

                    if let Err(e) = self.poll.registry().register(
                        &mut socket,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("cannot register connection from {}: {}", peer, e);
                        continue;
                    }
                    debug!("accepted {} as {:?}", peer, token);

                    let router = self.listeners[index].1;
                    let max_body_size = self.routers[router].max_body_size();
                    self.connections.insert(
                        token,
                        Connection::new(token, pipe_token, socket, router, max_body_size),
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Typically descriptor exhaustion: refuse new work, keep serving the rest.
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn on_socket(&mut self, token: Token, readable: bool) {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        if readable {
            if let Some(request) = conn.read_request() {
                let dispatch = self.routers[conn.router].handle(&request);
                conn.start(dispatch, registry, &mut self.pipes);
            }
        }
        conn.flush(registry, &mut self.pipes);
    }

    fn on_output(&mut self, token: Token) {
        let registry = self.poll.registry();
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.pump(registry, &mut self.pipes);
            conn.flush(registry, &mut self.pipes);
        }
    }

    /// Checks exit status and execution deadlines of running scripts.
    fn tick(&mut self) {
        let now = Instant::now();
        let registry = self.poll.registry();
        for conn in self.connections.values_mut() {
            if conn.relay.is_some() {
                conn.tick(now, registry, &mut self.pipes);
                conn.flush(registry, &mut self.pipes);
            }
        }
        for router in &self.routers {
            router.reap_orphans();
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let finished: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_done(now))
            .map(|(token, _)| *token)
            .collect();

        for token in finished {
            if let Some(mut conn) = self.connections.remove(&token) {
                if let Some(mut pipe) = conn.relay.as_mut().and_then(Relay::take_output) {
                    let _ = self.poll.registry().deregister(&mut pipe);
                }
                self.pipes.remove(&conn.pipe_token);
                if conn.abortive {
                    conn.reset();
                }
                let _ = self.poll.registry().deregister(&mut conn.socket);
                debug!("closed {:?}", token);
                // Dropping `conn` kills and reaps a script that is still running.
            }
        }
    }
}

impl Connection {
    fn new(token: Token, pipe_token: Token, socket: TcpStream, router: usize, max_body_size: usize) -> Self {
        Connection {
            token,
            pipe_token,
            socket,
            router,
            parser: Parser::new(max_body_size),
            response_buf: Vec::new(),
            relay: None,
            dispatched: false,
            backlogged: false,
            is_closing: false,
            abortive: false,
            hung_up: false,
            last_activity: Instant::now(),
        }
    }

    /// Reads what the socket has. Returns the request once it is complete.
    /// After dispatch, reads only serve to notice the client leaving.
    fn read_request(&mut self) -> Option<Request> {
        let mut buffer = [0; 4096];
        let mut request = None;
        self.last_activity = Instant::now();

        loop {
            match self.socket.read(&mut buffer) {
                Ok(0) => {
                    self.hang_up("client closed the connection");
                    break;
                }
                Ok(n) => {
                    if self.dispatched {
                        continue;
                    }
                    self.parser.parse(&buffer[..n]);
                    match self.parser.state {
                        ParseState::Done => {
                            self.dispatched = true;
                            request = Some(self.parser.take_request());
                        }
                        ParseState::Error => {
                            self.reject(GatewayError::BadRequest("unparseable request".to_string()))
                        }
                        ParseState::TooLarge => self.reject(GatewayError::PayloadTooLarge(
                            "body exceeds client_max_body_size".to_string(),
                        )),
                        _ => {}
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.hang_up(&format!("read failed: {}", e));
                    break;
                }
            }
        }

        if self.hung_up {
            None
        } else {
            request
        }
    }

    fn reject(&mut self, err: GatewayError) {
        warn!("{:?}: {}", self.token, err);
        self.dispatched = true;
        self.is_closing = true;
        self.response_buf
            .extend_from_slice(&generate_error_response(&err).to_bytes());
    }

    fn start(&mut self, dispatch: Dispatch, registry: &Registry, pipes: &mut HashMap<Token, Token>) {
        match dispatch {
            Dispatch::Respond(response) => {
                self.response_buf.extend_from_slice(&response.to_bytes());
                self.is_closing = true;
            }
            Dispatch::Stream(mut relay) => {
                let registered = match relay.output() {
                    Some(pipe) => registry.register(pipe, self.pipe_token, Interest::READABLE),
                    None => Err(io::Error::new(io::ErrorKind::Other, "script has no output pipe")),
                };
                if let Err(source) = registered {
                    let err = GatewayError::Launch {
                        script: relay.script().to_string(),
                        source,
                    };
                    relay.fail(err, &mut self.response_buf);
                    self.is_closing = true;
                    return;
                }
                pipes.insert(self.pipe_token, self.token);
                self.relay = Some(relay);
                // Output written before registration would not raise an edge.
                self.pump(registry, pipes);
            }
        }
    }

    fn pump(&mut self, registry: &Registry, pipes: &mut HashMap<Token, Token>) {
        if self.hung_up {
            return;
        }
        let Some(relay) = self.relay.as_mut() else {
            return;
        };

        let ending = match relay.pump(&mut self.response_buf, HIGH_WATER) {
            Ok(Pump::Pending) => None,
            Ok(Pump::Backlogged) => {
                self.backlogged = true;
                None
            }
            Ok(Pump::Eof) => {
                if let Some(mut pipe) = relay.take_output() {
                    let _ = registry.deregister(&mut pipe);
                    pipes.remove(&self.pipe_token);
                }
                relay.poll_exit(&mut self.response_buf)
            }
            Err(err) => Some(relay.fail(err, &mut self.response_buf)),
        };

        if let Some(ending) = ending {
            self.settle(ending, registry, pipes);
        }
    }

    fn tick(&mut self, now: Instant, registry: &Registry, pipes: &mut HashMap<Token, Token>) {
        if self.hung_up {
            return;
        }
        let Some(relay) = self.relay.as_mut() else {
            return;
        };

        if let Some(ending) = relay.poll(now, &mut self.response_buf) {
            self.settle(ending, registry, pipes);
        }
    }

    /// The relay is over; close once the buffered bytes are out. A truncated
    /// chunked stream closes without its terminator. A close-delimited body
    /// has no terminator to withhold, so it ends with a reset.
    fn settle(&mut self, ending: Ending, registry: &Registry, pipes: &mut HashMap<Token, Token>) {
        if let Some(mut relay) = self.relay.take() {
            if let Some(mut pipe) = relay.take_output() {
                let _ = registry.deregister(&mut pipe);
            }
            if matches!(ending, Ending::Truncated(_)) && relay.framing() == Framing::CloseDelimited {
                self.abortive = true;
            }
        }
        pipes.remove(&self.pipe_token);
        self.backlogged = false;
        self.is_closing = true;
        debug!("{:?} settled: {:?}", self.token, ending);
    }

    fn flush(&mut self, registry: &Registry, pipes: &mut HashMap<Token, Token>) {
        loop {
            while !self.response_buf.is_empty() {
                if self.hung_up {
                    return;
                }
                match self.socket.write(&self.response_buf) {
                    Ok(0) => {
                        self.hang_up("socket accepted no bytes");
                        return;
                    }
                    Ok(n) => {
                        self.response_buf.drain(..n);
                        self.last_activity = Instant::now();
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.hang_up(&format!("write failed: {}", e));
                        return;
                    }
                }
            }

            if !self.backlogged {
                return;
            }
            self.backlogged = false;
            self.pump(registry, pipes);
            if self.response_buf.is_empty() {
                return;
            }
        }
    }

    fn hang_up(&mut self, reason: &str) {
        if self.hung_up {
            return;
        }
        self.hung_up = true;
        self.response_buf.clear();
        match self.relay.as_mut() {
            Some(relay) => relay.abort(reason),
            None => debug!("{:?}: {}", self.token, reason),
        }
    }

    /// SO_LINGER with a zero timeout makes the close send RST.
    fn reset(&self) {
        let abort = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        if let Err(e) = setsockopt(&self.socket, sockopt::Linger, &abort) {
            warn!("{:?}: cannot arm reset: {}", self.token, e);
        }
    }

    fn is_done(&self, now: Instant) -> bool {
        self.hung_up
            || (self.is_closing && self.response_buf.is_empty())
            || (self.relay.is_none() && now.duration_since(self.last_activity) > IDLE_TIMEOUT)
    }
}
