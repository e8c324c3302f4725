use crate::cmd::Command;
use crate::transport::{BoxStream, Transport};
use crate::{tls, Error, Frame, PoolConfig, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Opens authenticated transports to the configured store.
#[derive(Clone)]
pub(crate) struct Dialer {
    config: Arc<PoolConfig>,
    tls: Option<TlsConnector>,
}

impl Dialer {
    pub(crate) fn new(config: Arc<PoolConfig>) -> Result<Dialer> {
        let tls = if config.use_tls {
            Some(tls::connector(config.tls_insecure)?)
        } else {
            None
        };

        Ok(Dialer { config, tls })
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Dial once: TCP connect under the connect timeout, optional TLS, then
    /// the authentication handshake. A failed handshake drops the socket.
    pub(crate) async fn dial(&self) -> Result<Transport> {
        let addr = self.config.addr();
        let socket = match time::timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::Timeout(self.config.connect_timeout)),
        };
        socket.set_nodelay(true)?;

        let stream: BoxStream = match &self.tls {
            Some(connector) => {
                let name = tls::server_name(&self.config.host)?;
                Box::new(connector.connect(name, socket).await?)
            }
            None => Box::new(socket),
        };

        let mut transport = Transport::new(stream, self.config.read_timeout);
        self.handshake(&mut transport).await?;

        debug!(%addr, "dialed");
        Ok(transport)
    }

    async fn handshake(&self, transport: &mut Transport) -> Result<()> {
        let config = &self.config;

        if let Some(password) = &config.password {
            let mut auth = Command::new("AUTH");
            if let Some(username) = &config.username {
                auth = auth.arg(username);
            }
            expect_ok(transport.request(&auth.arg(password)).await?)?;
        }

        if config.database != 0 {
            let select = Command::new("SELECT").arg(config.database);
            expect_ok(transport.request(&select).await?)?;
        }

        if let Some(code) = &config.auth_code {
            expect_ok(transport.request(&Command::new("AUTH").arg(code)).await?)?;
        }

        Ok(())
    }

    /// Keep dialing until a transport is established or the retry window has
    /// elapsed, pausing between attempts. Returns the last dial error.
    pub(crate) async fn dial_with_retry(&self) -> Result<Transport> {
        let deadline = Instant::now() + self.config.dial_retry_window;

        loop {
            let err = match self.dial().await {
                Ok(transport) => return Ok(transport),
                Err(err) => err,
            };
            warn!(addr = %self.config.addr(), cause = %err, "failed to dial store");

            time::sleep(self.config.dial_retry_pause).await;
            if Instant::now() >= deadline {
                return Err(err);
            }
        }
    }
}

fn expect_ok(frame: Frame) -> Result<()> {
    match frame {
        Frame::Simple(ref s) if s == "OK" => Ok(()),
        other => Err(other.to_error()),
    }
}
