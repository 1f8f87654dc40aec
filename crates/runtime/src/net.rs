//! Connection multiplexing
//!
//! One non-blocking listener plus a table of client connections with
//! free-id reuse. The outer loop drives everything through `poll(2)`:
//! readable sockets are drained through the telnet decoder into framed
//! lines, writable sockets flush their buffered output up to a byte
//! budget per wake (the remainder stays queued and the socket re-arms
//! for write readiness). No call here ever blocks the engine.

use crate::telnet::{encode_output, TelnetState, GA, IAC};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tern_core::ObjRef;

/// Bytes flushed per connection per wake.
const WRITE_BUDGET: usize = 4096;

/// Ceiling on buffered output per connection; beyond it the peer is
/// considered stuck and dropped.
const MAX_OUTBUF: usize = 1 << 20;

const MAX_CONNS: usize = 10_000;

#[derive(Debug)]
pub enum NetEvent {
    Connected(usize),
    Line(usize, String),
    Gone(usize),
}

pub struct Connection {
    stream: TcpStream,
    pub telnet: TelnetState,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    pub obj: Option<ObjRef>,
    pub connect_time: i64,
    pub last_input: i64,
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    dead: bool,
    pub mssp_sent: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, now: i64) -> Connection {
        let local = stream.local_addr().ok();
        Connection {
            stream,
            telnet: TelnetState::new(),
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            obj: None,
            connect_time: now,
            last_input: now,
            peer,
            local,
            dead: false,
            mssp_sent: false,
        }
    }
}

pub struct Connections {
    listener: Option<TcpListener>,
    conns: Vec<Option<Connection>>,
    free_ids: Vec<usize>,
    pub write_budget: usize,
}

impl Default for Connections {
    fn default() -> Self {
        Connections::new()
    }
}

impl Connections {
    pub fn new() -> Connections {
        Connections {
            listener: None,
            conns: Vec::new(),
            free_ids: Vec::new(),
            write_budget: WRITE_BUDGET,
        }
    }

    pub fn listen(&mut self, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        tracing::info!(port, "listening");
        self.listener = Some(listener);
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    fn alloc(&mut self, conn: Connection) -> Option<usize> {
        if let Some(id) = self.free_ids.pop() {
            self.conns[id] = Some(conn);
            return Some(id);
        }
        if self.conns.len() >= MAX_CONNS {
            return None;
        }
        self.conns.push(Some(conn));
        Some(self.conns.len() - 1)
    }

    pub fn get(&self, dev: usize) -> Option<&Connection> {
        self.conns.get(dev).and_then(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, dev: usize) -> Option<&mut Connection> {
        self.conns.get_mut(dev).and_then(|c| c.as_mut())
    }

    pub fn count(&self) -> usize {
        self.conns.iter().filter(|c| c.is_some()).count()
    }

    pub fn devices(&self) -> Vec<usize> {
        (0..self.conns.len())
            .filter(|i| self.conns[*i].is_some())
            .collect()
    }

    /// Queue text for a device; flushed under the write budget on the
    /// next wake.
    pub fn send(&mut self, dev: usize, text: &str) {
        if let Some(conn) = self.get_mut(dev) {
            conn.outbuf.extend_from_slice(&encode_output(text));
            if conn.outbuf.len() > MAX_OUTBUF {
                tracing::warn!(dev, "output buffer overflow, dropping connection");
                conn.dead = true;
            }
        }
    }

    /// Send a prompt; when suppress-go-ahead was not negotiated the
    /// prompt is followed by IAC GA.
    pub fn send_prompt(&mut self, dev: usize, text: &str) {
        let needs_ga = self.get(dev).map(|c| !c.telnet.sga).unwrap_or(false);
        if let Some(conn) = self.get_mut(dev) {
            conn.outbuf.extend_from_slice(&encode_output(text));
            if needs_ga {
                conn.outbuf.extend_from_slice(&[IAC, GA]);
            }
        }
    }

    pub fn send_raw(&mut self, dev: usize, bytes: &[u8]) {
        if let Some(conn) = self.get_mut(dev) {
            conn.outbuf.extend_from_slice(bytes);
        }
    }

    /// Flush a device's whole buffer now, ignoring the budget.
    pub fn flush(&mut self, dev: usize) {
        if let Some(conn) = self.get_mut(dev) {
            while !conn.outbuf.is_empty() {
                match conn.stream.write(&conn.outbuf) {
                    Ok(0) => break,
                    Ok(n) => {
                        conn.outbuf.drain(..n);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        conn.dead = true;
                        break;
                    }
                }
            }
        }
    }

    /// Close a device immediately and recycle its id.
    pub fn disconnect(&mut self, dev: usize) {
        if dev < self.conns.len() && self.conns[dev].is_some() {
            self.conns[dev] = None;
            self.free_ids.push(dev);
        }
    }

    /// Open an outbound connection (the connect_device builtin).
    pub fn connect_out(&mut self, address: &str, port: u16, now: i64) -> Result<usize, String> {
        let addrs: Vec<SocketAddr> = format!("{}:{}", address, port)
            .parse()
            .map(|a| vec![a])
            .or_else(|_| {
                use std::net::ToSocketAddrs;
                (address, port)
                    .to_socket_addrs()
                    .map(|it| it.collect())
                    .map_err(|e| e.to_string())
            })
            .map_err(|e: String| e)?;
        let addr = addrs.first().ok_or_else(|| "no address".to_string())?;
        let stream = TcpStream::connect_timeout(addr, Duration::from_secs(5))
            .map_err(|e| e.to_string())?;
        stream.set_nonblocking(true).map_err(|e| e.to_string())?;
        let conn = Connection::new(stream, *addr, now);
        self.alloc(conn)
            .ok_or_else(|| "connection limit reached".to_string())
    }

    /// Multiplex: wait up to `timeout_ms` for I/O, then accept, read,
    /// frame, and flush. Returns the events of this wake.
    pub fn pump(&mut self, timeout_ms: i32, now: i64) -> Vec<NetEvent> {
        let mut events = Vec::new();
        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut owners: Vec<Option<usize>> = Vec::new();
        if let Some(l) = &self.listener {
            fds.push(libc::pollfd {
                fd: l.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            owners.push(None);
        }
        for (i, slot) in self.conns.iter().enumerate() {
            if let Some(conn) = slot {
                let mut ev = libc::POLLIN;
                if !conn.outbuf.is_empty() {
                    ev |= libc::POLLOUT;
                }
                fds.push(libc::pollfd {
                    fd: conn.stream.as_raw_fd(),
                    events: ev,
                    revents: 0,
                });
                owners.push(Some(i));
            }
        }
        if fds.is_empty() {
            if timeout_ms > 0 {
                std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            }
            return events;
        }
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            return events;
        }

        for (k, pfd) in fds.iter().enumerate() {
            match owners[k] {
                None => {
                    if pfd.revents & libc::POLLIN != 0 {
                        self.accept_all(now, &mut events);
                    }
                }
                Some(dev) => {
                    if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                        self.read_device(dev, now, &mut events);
                    }
                    if pfd.revents & libc::POLLOUT != 0 {
                        self.flush_budgeted(dev);
                    }
                }
            }
        }

        // Reap dead connections last so their final events are kept.
        for dev in 0..self.conns.len() {
            let dead = self.conns[dev].as_ref().map(|c| c.dead).unwrap_or(false);
            if dead {
                events.push(NetEvent::Gone(dev));
                self.disconnect(dev);
            }
        }
        events
    }

    fn accept_all(&mut self, now: i64, events: &mut Vec<NetEvent>) {
        loop {
            let Some(listener) = &self.listener else { return };
            match listener.accept() {
                Ok((stream, peer)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let mut conn = Connection::new(stream, peer, now);
                    conn.outbuf
                        .extend_from_slice(&TelnetState::initial_negotiation());
                    match self.alloc(conn) {
                        Some(id) => {
                            tracing::info!(dev = id, peer = %peer, "connection accepted");
                            events.push(NetEvent::Connected(id));
                        }
                        None => tracing::warn!(peer = %peer, "connection limit reached"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn read_device(&mut self, dev: usize, now: i64, events: &mut Vec<NetEvent>) {
        let Some(conn) = self.get_mut(dev) else { return };
        let mut chunk = [0u8; 4096];
        let mut raw = Vec::new();
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    conn.dead = true;
                    break;
                }
                Ok(n) => {
                    raw.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    conn.dead = true;
                    break;
                }
            }
        }
        if !raw.is_empty() {
            conn.last_input = now;
            let mut data = Vec::new();
            let mut reply = Vec::new();
            conn.telnet.feed(&raw, &mut data, &mut reply);
            conn.outbuf.extend_from_slice(&reply);
            conn.inbuf.extend_from_slice(&data);
            while let Some(pos) = conn.inbuf.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = conn.inbuf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8_lossy(&line).to_string();
                events.push(NetEvent::Line(dev, text));
            }
        }
    }

    fn flush_budgeted(&mut self, dev: usize) {
        let budget = self.write_budget;
        if let Some(conn) = self.get_mut(dev) {
            let mut written = 0usize;
            while written < budget && !conn.outbuf.is_empty() {
                let n = budget - written;
                let take = n.min(conn.outbuf.len());
                match conn.stream.write(&conn.outbuf[..take]) {
                    Ok(0) => break,
                    Ok(n) => {
                        conn.outbuf.drain(..n);
                        written += n;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        conn.dead = true;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_and_accept() {
        let mut conns = Connections::new();
        conns.listen(0).unwrap();
        assert!(conns.is_listening());
        let port = conns
            .listener
            .as_ref()
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Give the kernel a beat, then pump.
        let events = conns.pump(200, 0);
        assert!(matches!(events.first(), Some(NetEvent::Connected(_))));
        drop(client);
    }

    #[test]
    fn test_line_framing_and_gone() {
        let mut conns = Connections::new();
        conns.listen(0).unwrap();
        let port = conns
            .listener
            .as_ref()
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let events = conns.pump(200, 0);
        let dev = match events.first() {
            Some(NetEvent::Connected(d)) => *d,
            other => panic!("expected Connected, got {:?}", other),
        };
        client.write_all(b"say hello\r\npartial").unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let events = conns.pump(200, 1);
        let lines: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                NetEvent::Line(d, l) if *d == dev => Some(l),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![&"say hello".to_string()]);
        // Complete the partial line.
        client.write_all(b" done\n").unwrap();
        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        let events = conns.pump(200, 2);
        let mut saw_line = false;
        let mut saw_gone = false;
        for e in &events {
            match e {
                NetEvent::Line(d, l) if *d == dev => {
                    assert_eq!(l, "partial done");
                    saw_line = true;
                }
                NetEvent::Gone(d) if *d == dev => saw_gone = true,
                _ => {}
            }
        }
        assert!(saw_line);
        assert!(saw_gone);
    }

    #[test]
    fn test_id_reuse() {
        let mut conns = Connections::new();
        conns.listen(0).unwrap();
        let port = conns
            .listener
            .as_ref()
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let c1 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let events = conns.pump(200, 0);
        let dev = match events.first() {
            Some(NetEvent::Connected(d)) => *d,
            other => panic!("expected Connected, got {:?}", other),
        };
        drop(c1);
        std::thread::sleep(Duration::from_millis(50));
        conns.pump(200, 1);
        assert_eq!(conns.count(), 0);
        let _c2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let events = conns.pump(200, 2);
        match events.first() {
            Some(NetEvent::Connected(d)) => assert_eq!(*d, dev),
            other => panic!("expected Connected, got {:?}", other),
        }
    }
}
