use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rax_ftp_runtime::secure::config::{client_config, root_store, server_config, server_name};
use rax_ftp_runtime::secure::{
    SECURE_READ, SECURE_RESUME_RECV, SecureContext, TlsRole, Transfer,
};
use rax_ftp_runtime::signal::{ManualClock, SignalGroup};
use rax_ftp_runtime::{Runtime, RuntimeConfig, Server};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        bind_address: "127.0.0.1".to_string(),
        control_port: 2121,
        tick_delay_ms: 1,
        poll_batch_size: 16,
        idle_timeout_ms: 30_000,
        banner: "test ready".to_string(),
        tls_cert_path: None,
        tls_key_path: None,
    }
}

// Helper to start a plaintext server on an ephemeral port
fn start(runtime: &Runtime) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    Server::from_listener(runtime, listener, &test_config(), None).unwrap()
}

// Helper to connect a blocking client with a short read timeout
fn connect(server: &Server) -> TcpStream {
    let client = TcpStream::connect(server.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(10)))
        .unwrap();
    client
}

// Helper to tick until `done` holds, giving up after about two seconds
fn tick_until(runtime: &Runtime, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        runtime.tick();
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

struct Reader {
    pending: Vec<u8>,
    closed: bool,
}

impl Reader {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Ticks the runtime until a full reply line arrives.
    fn line(&mut self, runtime: &Runtime, client: &mut TcpStream) -> Option<String> {
        for _ in 0..200 {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=end).collect();
                return Some(String::from_utf8_lossy(&raw).trim_end().to_string());
            }
            if self.closed {
                return None;
            }
            runtime.tick();
            let mut buf = [0u8; 256];
            match client.read(&mut buf) {
                Ok(0) => self.closed = true,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => panic!("client read failed: {}", e),
            }
        }
        None
    }
}

#[test]
fn test_greets_and_echoes_lines() {
    let runtime = Runtime::new(16);
    let server = start(&runtime);
    let mut client = connect(&server);
    let mut reader = Reader::new();

    assert_eq!(reader.line(&runtime, &mut client).as_deref(), Some("220 test ready"));
    assert_eq!(server.session_count(), 1);

    client.write_all(b"USER anonymous\r\nNOOP\r\n").unwrap();
    assert_eq!(
        reader.line(&runtime, &mut client).as_deref(),
        Some("200 USER anonymous")
    );
    assert_eq!(reader.line(&runtime, &mut client).as_deref(), Some("200 NOOP"));
}

#[test]
fn test_partial_lines_wait_for_newline() {
    let runtime = Runtime::new(16);
    let server = start(&runtime);
    let mut client = connect(&server);
    let mut reader = Reader::new();
    reader.line(&runtime, &mut client).unwrap();

    client.write_all(b"PW").unwrap();
    for _ in 0..5 {
        runtime.tick();
    }
    client.write_all(b"D\r\n").unwrap();
    assert_eq!(reader.line(&runtime, &mut client).as_deref(), Some("200 PWD"));
}

#[test]
fn test_quit_says_goodbye_and_closes() {
    let runtime = Runtime::new(16);
    let server = start(&runtime);
    let mut client = connect(&server);
    let mut reader = Reader::new();
    reader.line(&runtime, &mut client).unwrap();

    client.write_all(b"quit\r\n").unwrap();
    assert_eq!(reader.line(&runtime, &mut client).as_deref(), Some("221 Goodbye"));
    assert!(tick_until(&runtime, || server.session_count() == 0));
    assert_eq!(reader.line(&runtime, &mut client), None);
}

#[test]
fn test_peer_disconnect_drops_session() {
    let runtime = Runtime::new(16);
    let server = start(&runtime);
    let mut client = connect(&server);
    let mut reader = Reader::new();
    reader.line(&runtime, &mut client).unwrap();
    assert_eq!(server.session_count(), 1);

    drop(client);
    assert!(tick_until(&runtime, || server.session_count() == 0));
}

#[test]
fn test_idle_session_is_closed() {
    let clock = Rc::new(ManualClock::new());
    let runtime = Runtime::with_clock(16, clock.clone());
    let server = start(&runtime);
    let mut client = connect(&server);
    let mut reader = Reader::new();
    reader.line(&runtime, &mut client).unwrap();

    clock.advance(Duration::from_secs(20));
    client.write_all(b"NOOP\r\n").unwrap();
    assert_eq!(reader.line(&runtime, &mut client).as_deref(), Some("200 NOOP"));

    // Activity restarted the window.
    clock.advance(Duration::from_secs(20));
    runtime.tick();
    assert_eq!(server.session_count(), 1);

    clock.advance(Duration::from_secs(11));
    assert_eq!(
        reader.line(&runtime, &mut client).as_deref(),
        Some("421 Idle timeout")
    );
    assert_eq!(server.session_count(), 0);
}

#[test]
fn test_shutdown_closes_sessions() {
    let runtime = Runtime::new(16);
    let server = start(&runtime);
    let mut client = connect(&server);
    let mut reader = Reader::new();
    reader.line(&runtime, &mut client).unwrap();

    server.shutdown();
    assert_eq!(server.session_count(), 0);
    assert!(runtime.reactor().is_empty());
    assert_eq!(reader.line(&runtime, &mut client), None);
}

struct TlsClient {
    _socket: TcpStream,
    _group: SignalGroup,
    context: SecureContext,
    received: Rc<RefCell<Vec<u8>>>,
}

impl TlsClient {
    /// Ticks until a full reply line has been decrypted, and takes it.
    fn line(&self, runtime: &Runtime) -> Option<String> {
        let arrived = tick_until(runtime, || self.received.borrow().contains(&b'\n'));
        if !arrived {
            return None;
        }
        let mut received = self.received.borrow_mut();
        let end = received.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = received.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }
}

// Helper to start an implicit-TLS server and connect a secure client to it
fn start_tls(runtime: &Runtime) -> (Server, TlsClient) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    let tls = server_config(vec![cert.clone()], key.into()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = Server::from_listener(runtime, listener, &test_config(), Some(tls)).unwrap();

    let socket = TcpStream::connect(server.local_addr()).unwrap();
    let fd = socket.as_raw_fd();
    let reactor = runtime.reactor();
    reactor.monitor_new(fd, true, false).unwrap();
    let context = SecureContext::new(reactor);
    context
        .setup(TlsRole::Client {
            config: client_config(root_store([cert]).unwrap()).unwrap(),
            server_name: server_name("localhost").unwrap(),
        })
        .unwrap();
    context.connect(fd).unwrap();

    let group = SignalGroup::new(runtime.store());
    let received = Rc::new(RefCell::new(Vec::new()));
    for name in [SECURE_READ, SECURE_RESUME_RECV] {
        let sink = Rc::clone(&received);
        let reader = context.clone();
        context
            .signal_add(&group, name, move |_| {
                let mut buf = [0u8; 256];
                while let Ok(Transfer::Done(n)) = reader.recv(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    sink.borrow_mut().extend_from_slice(&buf[..n]);
                }
            })
            .unwrap();
    }
    assert!(!context.negotiate().unwrap());

    let client = TlsClient {
        _socket: socket,
        _group: group,
        context,
        received,
    };
    (server, client)
}

#[test]
fn test_implicit_tls_session() {
    let runtime = Runtime::new(16);
    let (server, client) = start_tls(&runtime);

    assert_eq!(client.line(&runtime).as_deref(), Some("220 test ready"));
    assert!(client.context.is_secure());
    assert_eq!(server.session_count(), 1);

    for command in ["SYST", "FEAT", "NOOP"] {
        let line = format!("{}\r\n", command);
        assert_eq!(
            client.context.send(line.as_bytes()).unwrap(),
            Transfer::Done(line.len())
        );
        assert_eq!(client.line(&runtime), Some(format!("200 {}", command)));
    }

    client.context.send(b"QUIT\r\n").unwrap();
    assert_eq!(client.line(&runtime).as_deref(), Some("221 Goodbye"));
    assert!(tick_until(&runtime, || server.session_count() == 0));
}

#[test]
fn test_active_tls_session_is_not_idle() {
    let clock = Rc::new(ManualClock::new());
    let runtime = Runtime::with_clock(16, clock.clone());
    let (server, client) = start_tls(&runtime);
    assert_eq!(client.line(&runtime).as_deref(), Some("220 test ready"));

    // The first command is read on secure-read; later ones come back
    // through secure-resume-recv and must still count as activity.
    for _ in 0..3 {
        clock.advance(Duration::from_secs(20));
        client.context.send(b"NOOP\r\n").unwrap();
        assert_eq!(client.line(&runtime).as_deref(), Some("200 NOOP"));
        assert_eq!(server.session_count(), 1);
    }

    clock.advance(Duration::from_secs(15));
    runtime.tick();
    assert_eq!(server.session_count(), 1);

    clock.advance(Duration::from_secs(16));
    assert_eq!(client.line(&runtime).as_deref(), Some("421 Idle timeout"));
    assert_eq!(server.session_count(), 0);
}
