//! Local in-process transport
//!
//! Serves every connection from a [`Service`] running on a thread of this
//! process, over a connected socket pair. Exercises the full wire protocol
//! without a listening server.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use color_eyre::Result;
use tracing::debug;

use bam_server::{ServerConfig, Service, Vcs};

use crate::{Connection, Transport};

/// In-process transport over a [`Service`]
pub struct LocalTransport<V: Vcs + 'static> {
    service: Arc<Service<V>>,
}

impl<V: Vcs + 'static> LocalTransport<V> {
    /// Start a service over `config` with `vcs` as its backend
    pub fn new(config: ServerConfig, vcs: V) -> Result<Self> {
        Ok(Self {
            service: Arc::new(Service::new(config, vcs)?),
        })
    }

    #[must_use]
    pub fn service(&self) -> &Service<V> {
        &self.service
    }
}

impl<V: Vcs + 'static> Transport for LocalTransport<V> {
    fn connect(&self) -> Result<Connection> {
        let (client, server) = UnixStream::pair()?;
        let service = Arc::clone(&self.service);
        let server_reader = server.try_clone()?;

        std::thread::Builder::new()
            .name("bam-local".into())
            .spawn(move || {
                if let Err(e) = service.serve(server_reader, server) {
                    debug!("local connection dropped: {e:#}");
                }
            })?;

        Ok(Connection::new(client.try_clone()?, client))
    }
}
