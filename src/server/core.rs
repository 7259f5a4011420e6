//! Module `core`
//!
//! Defines `Server`, which accepts control connections on a listening
//! monitor, optionally negotiates implicit TLS, and answers each line.

use log::{debug, error, info, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::collection::{Collectible, Collection, Policy};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::reactor::{Reactor, SOCKET_CONNECT};
use crate::runtime::Runtime;
use crate::secure::config::server_config_from_pem;
use crate::secure::{
    SECURE_CONNECT, SECURE_ERROR, SECURE_READ, SECURE_RESUME_RECV, SECURE_RESUME_SEND,
    SECURE_WRITE, SecureContext, TlsRole,
};
use crate::server::session::Session;
use crate::signal::{Raised, SignalGroup};

struct ServerInner {
    reactor: Reactor,
    listener: TcpListener,
    local_addr: SocketAddr,
    banner: String,
    idle_timeout: Duration,
    tls: Option<Arc<rustls::ServerConfig>>,
    sessions: Collection<Session>,
    group: SignalGroup,
}

/// Line-oriented control-port server running on the runtime's reactor.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    /// Binds the control port described by `config`, loading the TLS
    /// certificate when one is configured.
    pub fn bind(runtime: &Runtime, config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let tls = match config.tls_paths() {
            Some((cert, key)) => Some(server_config_from_pem(&cert, &key)?),
            None => None,
        };
        let listener = TcpListener::bind(config.control_socket())?;
        Self::from_listener(runtime, listener, config, tls)
    }

    /// Serves on an already bound listener.
    pub fn from_listener(
        runtime: &Runtime,
        listener: TcpListener,
        config: &RuntimeConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self, RuntimeError> {
        let reactor = runtime.reactor().clone();
        let local_addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();
        reactor.monitor_new(fd, false, true)?;

        let server = Self {
            inner: Rc::new(ServerInner {
                sessions: Collection::new(runtime.store(), Policy::Cascade),
                group: SignalGroup::new(runtime.store()),
                reactor,
                listener,
                local_addr,
                banner: config.banner.clone(),
                idle_timeout: config.idle_timeout(),
                tls,
            }),
        };

        let weak = Rc::downgrade(&server.inner);
        let registered =
            server
                .inner
                .reactor
                .signal_add(fd, &server.inner.group, SOCKET_CONNECT, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        Server { inner }.accept_pending();
                    }
                });
        if let Err(e) = registered {
            server.inner.reactor.monitor_fd_closed(fd);
            return Err(e.into());
        }

        info!(
            "Server bound to {} (TLS: {})",
            local_addr,
            server.inner.tls.is_some()
        );
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Closes the listener's monitor and every session.
    pub fn shutdown(&self) {
        self.inner.group.destroy();
        self.inner
            .reactor
            .monitor_fd_closed(self.inner.listener.as_raw_fd());
        self.inner.sessions.destroy();
        info!("Server on {} shut down", self.inner.local_addr);
    }

    fn accept_pending(&self) {
        loop {
            match self.inner.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.start_session(stream, peer) {
                        warn!("Failed to start session for {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
    }

    fn start_session(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), RuntimeError> {
        let reactor = &self.inner.reactor;
        let store = reactor.store();
        let fd = stream.as_raw_fd();
        let _ = stream.set_nodelay(true);
        reactor.monitor_new(fd, true, false)?;

        let secure = SecureContext::new(reactor);
        let attached = match &self.inner.tls {
            Some(tls) => secure
                .setup(TlsRole::Server(Arc::clone(tls)))
                .and_then(|_| secure.connect(fd)),
            None => secure.connect(fd),
        };
        if let Err(e) = attached {
            reactor.monitor_fd_closed(fd);
            return Err(e.into());
        }

        let group = SignalGroup::new(store);
        let session = Collectible::with_destructor(
            store,
            Session::new(stream, peer, secure.clone(), group),
            Session::teardown,
        );
        if let Err(e) = self.inner.sessions.add(&session) {
            session.destroy();
            return Err(e.into());
        }
        if let Err(e) = self.wire(&session) {
            self.drop_session(&session);
            return Err(e);
        }
        info!("Client {} connected on descriptor {}", peer, fd);

        if self.inner.tls.is_some() {
            if let Err(e) = secure.negotiate() {
                warn!("TLS handshake with {} failed: {}", peer, e);
                self.drop_session(&session);
            }
        } else {
            self.greet(&session);
        }
        Ok(())
    }

    /// Subscribes the session to its secure channels.
    fn wire(&self, session: &Collectible<Session>) -> Result<(), RuntimeError> {
        let secure = session.secure();
        let group = session.group();
        let on_read = self.handler(session, |server, session| server.serve(session));
        let on_resume_recv = self.handler(session, |server, session| server.serve(session));
        let on_send = self.handler(session, |server, session| server.pump(session));
        let on_connect = self.handler(session, |server, session| server.greet(session));
        let on_error = self.handler(session, |server, session| server.drop_session(session));
        let on_idle = self.handler(session, |server, session| {
            info!("Client {} idle, closing", session.peer());
            session.say_goodbye(421, "Idle timeout");
            server.drop_session(session);
        });

        let idle_watch = secure.signal_add(group, SECURE_READ, on_read)?;
        idle_watch.timeout(self.inner.idle_timeout, on_idle);
        session.set_idle_watch(idle_watch);
        secure.signal_add(group, SECURE_RESUME_RECV, on_resume_recv)?;
        secure.signal_add(group, SECURE_RESUME_SEND, on_send)?;
        secure.signal_add(group, SECURE_CONNECT, on_connect)?;
        secure.signal_add(group, SECURE_ERROR, on_error)?;
        Ok(())
    }

    /// Wraps a session handler into a signal callback that holds neither the
    /// server nor the session alive.
    fn handler(
        &self,
        session: &Collectible<Session>,
        handle: impl Fn(&Server, &Collectible<Session>) + 'static,
    ) -> impl Fn(&Raised<'_>) + 'static {
        let server = Rc::downgrade(&self.inner);
        let session = session.downgrade();
        move |_| {
            let (Some(inner), Some(session)) = (server.upgrade(), session.upgrade()) else {
                return;
            };
            handle(&Server { inner }, &session);
        }
    }

    fn greet(&self, session: &Collectible<Session>) {
        session.reply(220, &self.inner.banner);
        self.pump(session);
    }

    /// Flushes the session and keeps a `secure-write` subscription only while
    /// a send is blocked.
    fn pump(&self, session: &Collectible<Session>) {
        if !session.flush() {
            debug!("Session {} done", session.peer());
            self.drop_session(session);
            return;
        }
        if !session.is_write_blocked() {
            session.set_write_wait(None);
            return;
        }
        if session.secure().is_secure() || session.has_write_wait() {
            // Blocked TLS sends come back through secure-resume-send.
            return;
        }
        let on_write = self.handler(session, |server, session| server.pump(session));
        match session
            .secure()
            .signal_add(session.group(), SECURE_WRITE, on_write)
        {
            Ok(registration) => session.set_write_wait(Some(registration)),
            Err(e) => {
                warn!("Write wait for {} failed: {}", session.peer(), e);
                self.drop_session(session);
            }
        }
    }

    fn serve(&self, session: &Collectible<Session>) {
        session.touch();
        if session.on_readable() {
            self.pump(session);
        } else {
            self.drop_session(session);
        }
    }

    fn drop_session(&self, session: &Collectible<Session>) {
        if !session.is_valid() {
            return;
        }
        session.destroy();
        let _ = self.inner.sessions.delete(session);
    }
}
