//! Network front end: accepts clients, feeds their bytes through the query
//! parser into the command table and drains reply queues on writability.
//! Everything runs on the reactor thread.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use crate::ae::{EventLoop, Interest, TimerId, TimerMode};
use crate::buffer::Buffer;
use crate::command::{CommandTable, Context};
use crate::config::Config;
use crate::db::Db;
use crate::error::{ProtocolError, ServerError};
use crate::protocol::{ParseStatus, QueryParser};
use crate::reply::ReplyQueue;

pub const IO_BUF: usize = 16 * 1024;
pub const BACKLOG: i32 = 128;

#[derive(Debug)]
struct Client {
    socket: Socket,
    query: Buffer,
    parser: QueryParser,
    reply: ReplyQueue,
    close_after_reply: bool,
}

impl Client {
    fn new(socket: Socket) -> Self {
        Self {
            socket,
            query: Buffer::new(),
            parser: QueryParser::new(),
            reply: ReplyQueue::new(),
            close_after_reply: false,
        }
    }
}

/// Server state threaded through every reactor callback.
#[derive(Debug)]
pub struct Server {
    listener: Socket,
    clients: HashMap<RawFd, Client>,
    db: Db,
    commands: CommandTable,
    hz_ms: u64,
}

impl Server {
    /// Binds and listens; nothing is served until [`Server::run`].
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.addr();
        let listener = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            listener.set_only_v6(false)?;
        }
        listener.set_reuse_address(true)?;
        listener.bind(&SockAddr::from(addr))?;
        listener.set_nonblocking(true)?;
        listener.listen(BACKLOG)?;

        Ok(Self {
            listener,
            clients: HashMap::new(),
            db: Db::new(),
            commands: CommandTable::new(),
            hz_ms: config.hz_ms,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("listener is not an inet socket").into())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Registers the listener and the cron timer on `el`.
    pub fn start(&self, el: &mut EventLoop<Server>) -> TimerId {
        el.register(self.listener.as_fd(), Interest::Readable, accept_handler);
        el.add_timer(TimerMode::Normal, self.hz_ms, server_cron)
    }

    /// Serves until the event loop is stopped.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut el = EventLoop::new()?;
        self.start(&mut el);
        info!(addr = ?self.local_addr().ok(), "ready to accept connections");
        el.run(self);
        Ok(())
    }

    // Parses and executes every complete command buffered for `fd`.
    fn process_query_buf(&mut self, fd: RawFd, now_ms: u64) -> Result<(), ProtocolError> {
        let Server {
            clients,
            db,
            commands,
            ..
        } = self;
        let Some(client) = clients.get_mut(&fd) else {
            return Ok(());
        };

        while !client.close_after_reply {
            let args = match client.parser.parse(&mut client.query)? {
                ParseStatus::Complete(args) => args,
                ParseStatus::Incomplete => break,
            };
            if args.is_empty() {
                continue;
            }

            let mut ctx = Context {
                db: &mut *db,
                reply: &mut client.reply,
                now_ms,
                close_after_reply: false,
            };
            commands.dispatch(&mut ctx, &args);
            client.close_after_reply = ctx.close_after_reply;
        }
        Ok(())
    }
}

fn accept_handler(el: &mut EventLoop<Server>, server: &mut Server, _fd: RawFd) {
    loop {
        match server.listener.accept() {
            Ok((socket, peer)) => {
                if let Err(e) = socket.set_nonblocking(true) {
                    warn!("set nonblocking failed: {}", e);
                    continue;
                }
                let fd = socket.as_raw_fd();
                el.register(socket.as_fd(), Interest::Readable, read_query_from_client);
                if !el.is_registered(fd, Interest::Readable) {
                    continue;
                }
                info!(fd, peer = ?peer.as_socket(), "client connected");
                server.clients.insert(fd, Client::new(socket));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("accept error: {}", e);
                break;
            }
        }
    }
}

fn read_query_from_client(el: &mut EventLoop<Server>, server: &mut Server, fd: RawFd) {
    let Some(client) = server.clients.get_mut(&fd) else {
        return;
    };

    let mut buf = [0u8; IO_BUF];
    match (&client.socket).read(&mut buf) {
        Ok(0) => {
            debug!(fd, "client closed connection");
            free_client(el, server, fd);
            return;
        }
        Ok(n) => {
            trace!(fd, n, "read query");
            client.query.append(&buf[..n]);
        }
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
        Err(e) => {
            warn!(fd, "read error: {}", e);
            free_client(el, server, fd);
            return;
        }
    }

    if let Err(e) = server.process_query_buf(fd, el.now_ms()) {
        warn!(fd, "protocol error: {}", e);
        if let Some(client) = server.clients.get_mut(&fd) {
            client.reply.out_err(&format!("Protocol error: {}", e));
            let _ = client.reply.write_to(&mut &client.socket);
        }
        free_client(el, server, fd);
        return;
    }

    if let Some(client) = server.clients.get(&fd) {
        if !client.reply.is_empty() {
            el.register(client.socket.as_fd(), Interest::Writable, send_reply_to_client);
        }
    }
}

fn send_reply_to_client(el: &mut EventLoop<Server>, server: &mut Server, fd: RawFd) {
    let Some(client) = server.clients.get_mut(&fd) else {
        return;
    };

    match client.reply.write_to(&mut &client.socket) {
        Ok(n) => trace!(fd, n, pending = client.reply.pending_bytes(), "sent reply"),
        Err(e) => {
            warn!(fd, "write error: {}", e);
            free_client(el, server, fd);
            return;
        }
    }

    if client.reply.is_empty() {
        el.unregister(client.socket.as_fd(), Interest::Writable);
        if client.close_after_reply {
            free_client(el, server, fd);
        }
    }
}

// Unregisters both interests before the socket is closed on drop.
fn free_client(el: &mut EventLoop<Server>, server: &mut Server, fd: RawFd) {
    let Some(client) = server.clients.remove(&fd) else {
        return;
    };
    el.unregister(client.socket.as_fd(), Interest::Readable);
    el.unregister(client.socket.as_fd(), Interest::Writable);
    info!(fd, pending = client.reply.pending_bytes(), "client disconnected");
}

fn server_cron(el: &mut EventLoop<Server>, server: &mut Server, _id: TimerId) {
    let expired = server.db.active_expire_cycle(el.now_ms());
    if expired > 0 {
        debug!(expired, keys = server.db.len(), "server cron");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ae::ManualClock;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr, TcpStream};

    fn local_config() -> Config {
        Config {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Config::default()
        }
    }

    fn start() -> (Server, EventLoop<Server>, ManualClock, TcpStream) {
        let server = Server::bind(&local_config()).unwrap();
        let clock = ManualClock::new(0);
        let mut el = EventLoop::with_clock(clock.clone()).unwrap();
        server.start(&mut el);

        let stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        (server, el, clock, stream)
    }

    fn step(el: &mut EventLoop<Server>, server: &mut Server) {
        let fired = el.poll_once();
        el.process(server, fired);
    }

    // Drives the loop until `n` reply bytes have arrived.
    fn collect_reply(el: &mut EventLoop<Server>, server: &mut Server, stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        for _ in 0..100 {
            step(el, server);
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(k) => out.extend_from_slice(&chunk[..k]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("read failed: {e}"),
                }
            }
            if out.len() >= n {
                break;
            }
        }
        out
    }

    #[test]
    fn test_request_reply_cycle() {
        let (mut server, mut el, _clock, mut stream) = start();

        stream.write_all(b"SET k v\r\nGET k\r\n").unwrap();
        let reply = collect_reply(&mut el, &mut server, &mut stream, 12);
        assert_eq!(reply, b"+OK\r\n$1\r\nv\r\n");
        assert_eq!(server.client_count(), 1);

        let fd = *server.clients.keys().next().unwrap();
        assert!(el.is_registered(fd, Interest::Readable));
        assert!(!el.is_registered(fd, Interest::Writable));

        stream.write_all(b"QUIT\r\nGET k\r\n").unwrap();
        let reply = collect_reply(&mut el, &mut server, &mut stream, 5);
        assert_eq!(reply, b"+OK\r\n");
        assert_eq!(server.client_count(), 0);
        assert!(!el.is_registered(fd, Interest::Readable));
    }

    #[test]
    fn test_protocol_error_closes_client() {
        let (mut server, mut el, _clock, mut stream) = start();

        stream.write_all(b"*1\r\n#3\r\n").unwrap();
        let reply = collect_reply(&mut el, &mut server, &mut stream, 48);
        assert_eq!(reply, b"-ERR: Protocol error: expect $ for bulk length\r\n");
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_cron_expires_keys() {
        let (mut server, mut el, clock, mut stream) = start();

        stream.write_all(b"SET k v\r\nEXPIRE k 1\r\n").unwrap();
        collect_reply(&mut el, &mut server, &mut stream, 10);
        assert_eq!(server.db().len(), 1);
        assert_eq!(server.db().expires(), 1);

        clock.advance(1_000);
        step(&mut el, &mut server);
        assert_eq!(server.db().len(), 0);
    }
}
