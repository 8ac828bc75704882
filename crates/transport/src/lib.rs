//! bam-transport: client side of the BAM sync service
//!
//! A [`Transport`] opens one [`Connection`] per request. [`TcpTransport`]
//! talks to a running `bam-server`; [`LocalTransport`] serves requests
//! in-process, for tests and for working against a local repository.

pub mod client;
#[cfg(unix)]
pub mod local;

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;

use color_eyre::Result;
use tracing::debug;

use bam_core::{ProtocolReader, ProtocolWriter, Request};

pub use client::{Client, CommitOutcome, Progress, Quiet, find_session};
#[cfg(unix)]
pub use local::LocalTransport;

type BoxRead = Box<dyn Read + Send>;
type BoxWrite = Box<dyn Write + Send>;

/// One request/response exchange with the server
pub struct Connection {
    reader: ProtocolReader<BoxRead>,
    writer: ProtocolWriter<BoxWrite>,
}

impl Connection {
    pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self {
            reader: ProtocolReader::new(Box::new(BufReader::new(reader))),
            writer: ProtocolWriter::new(Box::new(BufWriter::new(writer))),
        }
    }

    /// Open the exchange with `request`
    pub fn send(&mut self, request: &Request) -> Result<()> {
        debug!("sending {} request", request.name());
        self.writer.send_magic()?;
        self.writer.send_request(request)
    }

    pub fn writer(&mut self) -> &mut ProtocolWriter<BoxWrite> {
        &mut self.writer
    }

    pub fn reader(&mut self) -> &mut ProtocolReader<BoxRead> {
        &mut self.reader
    }
}

/// Opens connections to a BAM service
pub trait Transport {
    fn connect(&self) -> Result<Connection>;
}

/// TCP connection to a `bam-server`
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Transport for TcpTransport {
    fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.address).map_err(|e| {
            color_eyre::eyre::eyre!("cannot reach server at {}: {e}", self.address)
        })?;
        stream.set_nodelay(true)?;
        Ok(Connection::new(stream.try_clone()?, stream))
    }
}
