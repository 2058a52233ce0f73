//! The TCP server task: parent of every session.

use crate::dispatcher::{Context, Task, TaskId};
use crate::session::{ServerCtx, Session};
use mio::net::TcpListener;
use rtkit::logging::{self, Logger};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

#[derive(Debug)]
pub enum BindError {
    /// The configured interface/port did not parse as a socket address.
    BadAddress(String),
    Io(io::Error),
}

impl From<io::Error> for BindError {
    fn from(error: io::Error) -> BindError {
        BindError::Io(error)
    }
}

pub struct ServerTask {
    listener: TcpListener,
    ctx: Rc<ServerCtx>,
    log: Logger,
}

impl ServerTask {
    /// Binds the listening socket. Setup failures surface here as values;
    /// nothing is registered with a dispatcher yet.
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        interface: &str,
        port: u16,
        ctx: Rc<ServerCtx>,
        log: L,
    ) -> Result<ServerTask, BindError> {
        let address: SocketAddr = format!("{}:{}", interface, port)
            .parse()
            .map_err(|_| BindError::BadAddress(format!("{}:{}", interface, port)))?;

        let listener = TcpListener::bind(&address)?;

        let log = match log.into() {
            Some(log) => log.new(logging::o!("listen" => address.to_string())),
            None => logging::discard_logger(),
        };

        logging::info!(log, "listening");

        Ok(ServerTask { listener, ctx, log })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Task for ServerTask {
    fn read(&mut self, cx: &mut Context) -> i32 {
        loop {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    logging::info!(self.log, "client connected"; "peer" => address.to_string());

                    let session = Session::new(stream, self.ctx.clone(), Some(&self.log));

                    match cx.spawn_child(Box::new(session)) {
                        Ok(id) => cx.set_timer_for(id, self.ctx.login_timeout),
                        Err(error) => {
                            logging::warn!(self.log, "session setup failed"; "error" => %error);
                        }
                    }
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    logging::error!(self.log, "accept failed"; "error" => %error);
                    return -1;
                }
            }
        }

        1
    }

    fn evented(&self) -> Option<&dyn mio::Evented> {
        Some(&self.listener)
    }

    fn child_gone(&mut self, child: TaskId) {
        logging::debug!(self.log, "session closed"; "task" => child);
    }
}
