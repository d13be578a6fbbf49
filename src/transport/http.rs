//! Single-connection HTTP command channel.
//!
//! Command frames arrive as `POST /cmd` bodies; responses go back verbatim
//! as `200 OK` octet streams. This is request framing only: one client at a
//! time, no routing beyond the one endpoint, no TLS. Extra clients are
//! refused at accept time so the session owning the device bus is never
//! contended.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use super::CommandTransport;
use crate::constants::PAGE_BUFFER_SIZE;

const COMMAND_PATH: &str = "/cmd";
const MAX_HEADERS: usize = 16;
const HEADER_BUF_SIZE: usize = 2048;
/// Largest body the channel accepts: opcode + parameters + page payload +
/// sync marker.
const MAX_BODY_SIZE: usize = PAGE_BUFFER_SIZE + 8;
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// How long one request may straggle across packets before it is dropped.
const REQUEST_DEADLINE: Duration = Duration::from_secs(2);

enum Request {
    /// A complete command frame for the programmer.
    Command(Vec<u8>),
    /// Anything other than `POST /cmd`.
    NotFound,
    /// A body too large to ever be a valid frame.
    TooLarge,
}

pub struct HttpTransport {
    listener: TcpListener,
    waiting: Option<(TcpStream, SocketAddr)>,
    client: Option<TcpStream>,
}

impl HttpTransport {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).with_context(|| format!("binding {}", addr))?;
        listener.set_nonblocking(true)?;
        log::info!(
            "command channel on http://{}{}",
            listener.local_addr()?,
            COMMAND_PATH
        );
        Ok(HttpTransport {
            listener,
            waiting: None,
            client: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn poll_accept(&mut self) {
        if self.waiting.is_some() {
            return;
        }
        match self.listener.accept() {
            Ok((stream, peer)) => self.waiting = Some((stream, peer)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("accept failed: {}", e),
        }
    }
}

impl CommandTransport for HttpTransport {
    fn session_waiting(&mut self) -> bool {
        self.poll_accept();
        self.waiting.is_some()
    }

    fn open_session(&mut self) -> Result<()> {
        let (stream, peer) = match self.waiting.take() {
            Some(w) => w,
            None => bail!("no client waiting"),
        };
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        log::info!("client connect {}", peer);
        self.client = Some(stream);
        Ok(())
    }

    fn session_alive(&mut self) -> bool {
        let stream = match self.client.as_mut() {
            Some(s) => s,
            None => return false,
        };
        match probe(stream) {
            Ok(alive) => alive,
            Err(_) => false,
        }
    }

    fn close_session(&mut self) {
        if let Some(stream) = self.client.take() {
            let _ = stream.shutdown(Shutdown::Both);
            log::info!("client disconnect");
        }
    }

    fn reject_incoming(&mut self) {
        if let Some((stream, peer)) = self.waiting.take() {
            log::info!("rejecting client {}", peer);
            let _ = stream.shutdown(Shutdown::Both);
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("rejecting client {}", peer);
                    let _ = stream.shutdown(Shutdown::Both);
                }
                Err(_) => break,
            }
        }
    }

    fn receive_body(&mut self) -> Result<Option<Vec<u8>>> {
        let stream = match self.client.as_mut() {
            Some(s) => s,
            None => return Ok(None),
        };
        if !data_ready(stream)? {
            return Ok(None);
        }
        match read_request(stream)? {
            Request::Command(body) => {
                log::debug!("<= {}", hex::encode(&body));
                Ok(Some(body))
            }
            Request::NotFound => {
                send_response(stream, "404 Not Found", &[])?;
                Ok(None)
            }
            Request::TooLarge => {
                send_response(stream, "413 Payload Too Large", &[])?;
                Ok(None)
            }
        }
    }

    fn send(&mut self, body: &[u8]) -> Result<()> {
        let stream = match self.client.as_mut() {
            Some(s) => s,
            None => bail!("no session to send on"),
        };
        log::debug!("=> {}", hex::encode(body));
        send_response(stream, "200 OK", body)
    }
}

/// Liveness check: false once the peer has closed its end.
fn probe(stream: &mut TcpStream) -> Result<bool> {
    stream.set_nonblocking(true)?;
    let mut one = [0u8; 1];
    let result = match stream.peek(&mut one) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(true),
        Err(e) => Err(e.into()),
    };
    stream.set_nonblocking(false)?;
    result
}

/// True if the peer has sent bytes we have not consumed yet.
fn data_ready(stream: &mut TcpStream) -> Result<bool> {
    stream.set_nonblocking(true)?;
    let mut one = [0u8; 1];
    let result = match stream.peek(&mut one) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    };
    stream.set_nonblocking(false)?;
    result
}

/// Read one full HTTP request off the stream. Called only once bytes are
/// known to be pending; short reads inside one request are retried until
/// `REQUEST_DEADLINE`.
fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let started = Instant::now();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];

    // headers first
    let (header_len, is_command, content_length) = loop {
        if buf.len() > HEADER_BUF_SIZE {
            bail!("request header section too large");
        }
        match stream.read(&mut chunk) {
            Ok(0) => bail!("client closed mid-request"),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if retryable(&e) => {
                if started.elapsed() > REQUEST_DEADLINE {
                    bail!("request timed out");
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf).context("malformed HTTP request")? {
            httparse::Status::Complete(header_len) => {
                let is_command =
                    req.method == Some("POST") && req.path.map(strip_query) == Some(COMMAND_PATH);
                let content_length = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                break (header_len, is_command, content_length);
            }
            httparse::Status::Partial => continue,
        }
    };

    if content_length > MAX_BODY_SIZE {
        // consume the oversized body so the reply goes out on a clean stream
        let mut left = content_length.saturating_sub(buf.len() - header_len);
        while left > 0 {
            match stream.read(&mut chunk) {
                Ok(0) => bail!("client closed mid-body"),
                Ok(n) => left = left.saturating_sub(n),
                Err(e) if retryable(&e) => {
                    if started.elapsed() > REQUEST_DEADLINE {
                        bail!("request body timed out");
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        return Ok(Request::TooLarge);
    }

    let mut body = buf.split_off(header_len);
    while body.len() < content_length {
        match stream.read(&mut chunk) {
            Ok(0) => bail!("client closed mid-body"),
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(e) if retryable(&e) => {
                if started.elapsed() > REQUEST_DEADLINE {
                    bail!("request body timed out");
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    body.truncate(content_length);

    if is_command {
        Ok(Request::Command(body))
    } else {
        Ok(Request::NotFound)
    }
}

fn strip_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

fn retryable(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn send_response(stream: &mut TcpStream, status: &str, body: &[u8]) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        status,
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
