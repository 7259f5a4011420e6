use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rax_ftp_runtime::Runtime;
use rax_ftp_runtime::error::SecureError;
use rax_ftp_runtime::secure::config::{client_config, root_store, server_config, server_name};
use rax_ftp_runtime::secure::{
    Operation, SECURE_CONNECT, SECURE_ERROR, SECURE_READ, SECURE_RESUME_RECV,
    SECURE_RESUME_SEND, SecureContext, Status, TlsRole, Transfer,
};
use rax_ftp_runtime::signal::{Raised, SignalGroup};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

// Helper to build a connected loopback pair: (client, accepted server side)
fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
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

// Helper to create server and client roles around a fresh self-signed cert
fn roles(name: &str) -> (TlsRole, TlsRole) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let server = server_config(vec![cert.clone()], key.into()).unwrap();
    let client = client_config(root_store([cert]).unwrap()).unwrap();
    (
        TlsRole::Server(server),
        TlsRole::Client {
            config: client,
            server_name: server_name(name).unwrap(),
        },
    )
}

// Helper for a callback that drains a context into `sink`
fn reader(context: &SecureContext, sink: &Rc<RefCell<Vec<u8>>>) -> impl Fn(&Raised<'_>) + 'static {
    let context = context.clone();
    let sink = Rc::clone(sink);
    move |_| {
        let mut buf = [0u8; 256];
        while let Ok(Transfer::Done(n)) = context.recv(&mut buf) {
            if n == 0 {
                break;
            }
            sink.borrow_mut().extend_from_slice(&buf[..n]);
        }
    }
}

// Helper for a callback that counts its invocations
fn counter() -> (Rc<Cell<usize>>, impl Fn(&Raised<'_>) + 'static) {
    let count = Rc::new(Cell::new(0));
    let seen = Rc::clone(&count);
    (count, move |_: &Raised<'_>| seen.set(seen.get() + 1))
}

struct Link {
    runtime: Runtime,
    group: SignalGroup,
    server: SecureContext,
    client: SecureContext,
    _sockets: (TcpStream, TcpStream),
}

// Helper to attach a server and a client context to both ends of a pair
fn link(server_role: Option<TlsRole>, client_role: Option<TlsRole>) -> Link {
    let runtime = Runtime::new(16);
    let reactor = runtime.reactor();
    let (client_sock, server_sock) = pair();
    reactor.monitor_new(server_sock.as_raw_fd(), true, false).unwrap();
    reactor.monitor_new(client_sock.as_raw_fd(), true, false).unwrap();

    let server = SecureContext::new(reactor);
    let client = SecureContext::new(reactor);
    if let Some(role) = server_role {
        server.setup(role).unwrap();
    }
    if let Some(role) = client_role {
        client.setup(role).unwrap();
    }
    server.connect(server_sock.as_raw_fd()).unwrap();
    client.connect(client_sock.as_raw_fd()).unwrap();
    let group = SignalGroup::new(runtime.store());
    Link {
        runtime,
        group,
        server,
        client,
        _sockets: (client_sock, server_sock),
    }
}

// Helper to run a full handshake on a linked pair
fn handshake(link: &Link) {
    let (server_up, on_server) = counter();
    let (client_up, on_client) = counter();
    link.server.signal_add(&link.group, SECURE_CONNECT, on_server).unwrap();
    link.client.signal_add(&link.group, SECURE_CONNECT, on_client).unwrap();

    assert!(!link.server.negotiate().unwrap());
    assert!(!link.client.negotiate().unwrap());
    assert!(tick_until(&link.runtime, || server_up.get() == 1 && client_up.get() == 1));
    assert_eq!(link.server.status(), Status::Connected);
    assert_eq!(link.client.status(), Status::Connected);
    assert!(link.server.is_secure() && link.client.is_secure());
}

#[test]
fn test_handshake_then_exchange() {
    let (server_role, client_role) = roles("localhost");
    let link = link(Some(server_role), Some(client_role));
    handshake(&link);

    let received = Rc::new(RefCell::new(Vec::new()));
    let on_read = reader(&link.server, &received);
    let on_resume = reader(&link.server, &received);
    link.server.signal_add(&link.group, SECURE_READ, on_read).unwrap();
    link.server.signal_add(&link.group, SECURE_RESUME_RECV, on_resume).unwrap();

    assert_eq!(link.client.send(b"hello").unwrap(), Transfer::Done(5));
    assert!(tick_until(&link.runtime, || received.borrow().as_slice() == b"hello"));
    assert_eq!(link.client.operation(), Operation::None);
}

#[test]
fn test_reply_after_drained_recv() {
    let (server_role, client_role) = roles("localhost");
    let link = link(Some(server_role), Some(client_role));
    handshake(&link);

    let at_server = Rc::new(RefCell::new(Vec::new()));
    let at_client = Rc::new(RefCell::new(Vec::new()));
    for name in [SECURE_READ, SECURE_RESUME_RECV] {
        link.server
            .signal_add(&link.group, name, reader(&link.server, &at_server))
            .unwrap();
        link.client
            .signal_add(&link.group, name, reader(&link.client, &at_client))
            .unwrap();
    }

    for round in 0..3 {
        let request = format!("PING {}\r\n", round);
        assert_eq!(
            link.client.send(request.as_bytes()).unwrap(),
            Transfer::Done(request.len())
        );
        assert!(tick_until(&link.runtime, || at_server.borrow().ends_with(b"\r\n")));
        assert_eq!(at_server.borrow().as_slice(), request.as_bytes());
        at_server.borrow_mut().clear();

        // The drain ended in TryAgain; the reply must still go out.
        assert_eq!(link.server.status(), Status::WantRead);
        assert_eq!(link.server.operation(), Operation::Recv);
        let reply = format!("200 PING {}\r\n", round);
        assert_eq!(
            link.server.send(reply.as_bytes()).unwrap(),
            Transfer::Done(reply.len())
        );
        assert_eq!(link.server.operation(), Operation::Recv);

        assert!(tick_until(&link.runtime, || at_client.borrow().ends_with(b"\r\n")));
        assert_eq!(at_client.borrow().as_slice(), reply.as_bytes());
        at_client.borrow_mut().clear();
    }
}

#[test]
fn test_blocked_send_is_retried_without_duplication() {
    const CHUNK: usize = 16 * 1024;
    let (server_role, client_role) = roles("localhost");
    let link = link(Some(server_role), Some(client_role));
    handshake(&link);

    let data: Vec<u8> = (0..32 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let mut sent = 0;
    let blocked = loop {
        assert!(sent + CHUNK <= data.len(), "socket never filled up");
        let chunk = &data[sent..sent + CHUNK];
        match link.server.send(chunk).unwrap() {
            Transfer::Done(n) => sent += n,
            Transfer::TryAgain => break chunk.to_vec(),
        }
    };
    assert_eq!(link.server.status(), Status::WantWrite);
    assert_eq!(link.server.operation(), Operation::Send);

    let (resumes, on_resume) = counter();
    link.server
        .signal_add(&link.group, SECURE_RESUME_SEND, on_resume)
        .unwrap();
    let received = Rc::new(RefCell::new(Vec::new()));
    for name in [SECURE_READ, SECURE_RESUME_RECV] {
        let sink = Rc::clone(&received);
        let context = link.client.clone();
        link.client
            .signal_add(&link.group, name, move |_| {
                let mut buf = vec![0u8; 64 * 1024];
                while let Ok(Transfer::Done(n)) = context.recv(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    sink.borrow_mut().extend_from_slice(&buf[..n]);
                }
            })
            .unwrap();
    }

    assert!(tick_until(&link.runtime, || resumes.get() > 0));
    match link.server.send(&blocked).unwrap() {
        Transfer::Done(n) => sent += n,
        Transfer::TryAgain => panic!("send still blocked after secure-resume-send"),
    }
    assert_eq!(link.server.operation(), Operation::None);

    assert!(tick_until(&link.runtime, || received.borrow().len() >= sent));
    assert_eq!(received.borrow().len(), sent);
    assert!(received.borrow().as_slice() == &data[..sent]);
}

#[test]
fn test_recv_during_handshake_is_rejected() {
    let (server_role, client_role) = roles("localhost");
    let link = link(Some(server_role), Some(client_role));
    assert!(!link.server.negotiate().unwrap());

    let mut buf = [0u8; 16];
    match link.server.recv(&mut buf) {
        Err(SecureError::InvalidState { status, operation }) => {
            assert_eq!(status, Status::WantRead);
            assert_eq!(operation, Operation::Handshake);
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert!(matches!(
        link.server.send(b"early"),
        Err(SecureError::InvalidState { .. })
    ));
    // A rejected call leaves the handshake untouched.
    assert_eq!(link.server.operation(), Operation::Handshake);
}

#[test]
fn test_untrusted_name_fails_with_error_signal() {
    let (server_role, client_role) = roles("example.com");
    let link = link(Some(server_role), Some(client_role));
    let (client_errors, on_error) = counter();
    link.client.signal_add(&link.group, SECURE_ERROR, on_error).unwrap();

    link.server.negotiate().unwrap();
    link.client.negotiate().unwrap();
    assert!(tick_until(&link.runtime, || client_errors.get() > 0));
    assert_eq!(link.client.status(), Status::Error);
    assert_eq!(link.client.operation(), Operation::None);
}

#[test]
fn test_cleartext_passthrough() {
    let runtime = Runtime::new(16);
    let reactor = runtime.reactor();
    let (mut peer, server_sock) = pair();
    let fd = server_sock.as_raw_fd();
    reactor.monitor_new(fd, true, false).unwrap();
    let context = SecureContext::new(reactor);
    context.connect(fd).unwrap();
    assert!(!context.is_secure());

    let group = SignalGroup::new(runtime.store());
    let received = Rc::new(RefCell::new(Vec::new()));
    context
        .signal_add(&group, SECURE_READ, reader(&context, &received))
        .unwrap();

    peer.write_all(b"USER anonymous\r\n").unwrap();
    assert!(tick_until(&runtime, || received.borrow().ends_with(b"\r\n")));
    assert_eq!(received.borrow().as_slice(), b"USER anonymous\r\n");

    assert_eq!(context.send(b"331 ok\r\n").unwrap(), Transfer::Done(8));
    let mut reply = [0u8; 8];
    peer.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"331 ok\r\n");

    assert!(matches!(context.drop_to_clear(), Err(SecureError::NotConfigured)));
    context.destroy();
    assert!(!context.is_valid());
    assert!(!reactor.is_monitored(fd));
    assert!(matches!(
        context.send(b"late"),
        Err(SecureError::ContextDestroyed)
    ));
}

#[test]
fn test_drop_to_clear_continues_in_cleartext() {
    let (server_role, client_role) = roles("localhost");
    let link = link(Some(server_role), Some(client_role));
    handshake(&link);

    let received = Rc::new(RefCell::new(Vec::new()));
    link.server
        .signal_add(&link.group, SECURE_READ, reader(&link.server, &received))
        .unwrap();

    link.client.drop_to_clear().unwrap();
    link.server.drop_to_clear().unwrap();
    assert!(tick_until(&link.runtime, || {
        !link.client.is_secure() && !link.server.is_secure()
    }));
    assert_eq!(link.client.status(), Status::None);

    assert_eq!(link.client.send(b"plain").unwrap(), Transfer::Done(5));
    assert!(tick_until(&link.runtime, || received.borrow().ends_with(b"plain")));
}

#[test]
fn test_negotiate_without_role_is_rejected() {
    let link = link(None, None);
    assert!(matches!(link.client.negotiate(), Err(SecureError::NotConfigured)));
    let detached = SecureContext::new(link.runtime.reactor());
    assert!(matches!(detached.recv(&mut [0u8; 4]), Err(SecureError::NotAttached)));
}
