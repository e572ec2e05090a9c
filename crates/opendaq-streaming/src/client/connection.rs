// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Blocking WebSocket connection used by the client handler.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::http::{self, HttpResponse};
use crate::protocol::websocket::{self, Opcode};
use crate::server::session::{Frame, FrameReader};

const READ_CHUNK: usize = 4096;
const INITIAL_READ_BUFFER: usize = 64 * 1024;

/// Resolve `host:port` and connect to the first address that answers.
pub(crate) fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(Error::from)
        .unwrap_or_else(|| Error::protocol(format!("{} did not resolve", host))))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Read one HTTP response; bytes after it are returned as well.
fn read_response(stream: &mut TcpStream, deadline: Instant) -> Result<(HttpResponse, Vec<u8>)> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some((response, used)) = http::parse_response(&buffer)? {
            return Ok((response, buffer.split_off(used)));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout("HTTP response".into()));
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(&mut chunk) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if is_timeout(&e) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// POST a JSON body to the control port and return the response.
pub(crate) fn post_json(
    host: &str,
    port: u16,
    body: &[u8],
    timeout: Duration,
) -> Result<HttpResponse> {
    let mut stream = connect_tcp(host, port, timeout)?;
    stream.write_all(&http::post_request(host, port, body))?;
    let (response, _) = read_response(&mut stream, Instant::now() + timeout)?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(response)
}

/// Client end of an upgraded streaming connection.
pub(crate) struct WsConnection {
    stream: TcpStream,
    reader: FrameReader,
}

impl WsConnection {
    /// Connect and perform the upgrade handshake.
    pub fn open(
        host: &str,
        port: u16,
        client_id: &str,
        timeout: Duration,
        max_frame_size: usize,
    ) -> Result<Self> {
        let mut stream = connect_tcp(host, port, timeout)?;
        let key = websocket::random_client_key();
        stream.write_all(&http::upgrade_request(host, port, &key, client_id))?;

        let (response, leftover) = read_response(&mut stream, Instant::now() + timeout)?;
        if response.status != 101 {
            return Err(Error::Rejected(format!(
                "upgrade answered {} {}",
                response.status, response.reason
            )));
        }
        let expected = websocket::accept_key(&key);
        if response.header("sec-websocket-accept") != Some(expected.as_str()) {
            return Err(Error::protocol("Sec-WebSocket-Accept mismatch"));
        }
        debug!("upgraded connection to {}:{}", host, port);

        let mut reader = FrameReader::growable(INITIAL_READ_BUFFER, max_frame_size);
        reader.seed(&leftover)?;
        Ok(Self { stream, reader })
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Second handle on the socket, used for writing.
    pub fn writer(&self) -> Result<TcpStream> {
        Ok(self.stream.try_clone()?)
    }

    /// Next frame, or `Ok(None)` when the read timeout expires first.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.reader.next_frame()? {
                return Ok(Some(frame));
            }
            match self.reader.fill_from(&mut self.stream) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(_) => {}
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Write one masked client frame.
pub(crate) fn write_frame(stream: &mut TcpStream, opcode: Opcode, payload: &[u8]) -> Result<()> {
    let frame = websocket::encode_frame(opcode, payload, Some(websocket::random_masking_key()));
    stream.write_all(&frame)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_upgrade_rejected_on_bad_accept_key() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).unwrap();
            sock.write_all(&http::upgrade_response("bogus")).unwrap();
        });

        let result = WsConnection::open("127.0.0.1", port, "t", Duration::from_secs(2), 4096);
        assert!(matches!(result, Err(Error::Protocol(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_upgrade_refused_status() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).unwrap();
            sock.write_all(&http::status_response(400, "Bad Request")).unwrap();
        });

        let result = WsConnection::open("127.0.0.1", port, "t", Duration::from_secs(2), 4096);
        assert!(matches!(result, Err(Error::Rejected(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(connect_tcp("127.0.0.1", port, Duration::from_millis(500)).is_err());
    }
}
