//! The TCP queue provider.
//!
//! A thin client for an out-of-process message broker. Unlike the
//! multicast provider there is no local queueing at all; `handle` reads
//! one message frame off the socket and dispatches it. Any I/O failure
//! drops the connection, and the next operation transparently reconnects
//! and replays the subscription list.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use error::*;
use lcm::registry::Registry;
use lcm::MAX_MESSAGE_SIZE;
use utils;

/// First word sent by the server.
const MAGIC_SERVER: u32 = 0x2876_17fa;
/// First word sent by the client.
const MAGIC_CLIENT: u32 = 0x2876_17fb;
/// The protocol version we implement.
const PROTOCOL_VERSION: u32 = 0x0100;

const MESSAGE_TYPE_PUBLISH: u32 = 1;
const MESSAGE_TYPE_SUBSCRIBE: u32 = 2;
const MESSAGE_TYPE_UNSUBSCRIBE: u32 = 3;

const DEFAULT_SERVER_ADDR: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 7700;

/// Upper bound on the channel length field of an inbound frame. Anything
/// bigger means the stream has desynchronized.
const MAX_FRAME_CHANNEL_LENGTH: u32 = 1000;

struct Connection {
    socket: Option<TcpStream>,
    /// Channels to replay to the server after every reconnect.
    subscriptions: Vec<String>,
}

impl Connection {
    /// Connects, exchanges handshakes, and replays the subscription list.
    fn connect(&mut self, addr: &str, port: u16) -> io::Result<()> {
        info!("Connecting to tcpq server at {}:{}", addr, port);
        self.socket = None;

        let mut socket = TcpStream::connect((addr, port))?;

        socket.write_u32::<NetworkEndian>(MAGIC_CLIENT)?;
        socket.write_u32::<NetworkEndian>(PROTOCOL_VERSION)?;

        let server_magic = socket.read_u32::<NetworkEndian>()?;
        let _server_version = socket.read_u32::<NetworkEndian>()?;
        if server_magic != MAGIC_SERVER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid response from tcpq server",
            ));
        }

        for channel in &self.subscriptions {
            send_channel_frame(&mut socket, MESSAGE_TYPE_SUBSCRIBE, channel)?;
        }

        debug!("Connected to tcpq server");
        self.socket = Some(socket);
        Ok(())
    }

    fn ensure_connected(&mut self, addr: &str, port: u16) -> io::Result<&mut TcpStream> {
        if self.socket.is_none() {
            self.connect(addr, port)?;
        }
        match self.socket {
            Some(ref mut socket) => Ok(socket),
            None => unreachable!(),
        }
    }

    /// Drops the connection after an I/O failure.
    fn disconnect(&mut self) {
        debug!("Disconnected from tcpq server");
        self.socket = None;
    }
}

/// The TCP queue provider.
pub struct TcpqProvider {
    registry: Arc<Registry>,
    server_addr: String,
    server_port: u16,
    conn: Mutex<Connection>,
}

impl TcpqProvider {
    /// Creates the provider and makes a first connection attempt.
    ///
    /// A server that is not up yet is not an error; every later operation
    /// retries the connection.
    pub fn new(
        registry: Arc<Registry>,
        network: &str,
        _options: &HashMap<&str, &str>,
    ) -> Result<TcpqProvider, InitError> {
        let (server_addr, server_port) = parse_target(network)?;

        debug!(
            "Starting tcpq provider (server = {}:{})",
            server_addr, server_port
        );

        let provider = TcpqProvider {
            registry,
            server_addr,
            server_port,
            conn: Mutex::new(Connection {
                socket: None,
                subscriptions: Vec::new(),
            }),
        };

        {
            let mut conn = provider.conn.lock().unwrap();
            if let Err(e) = conn.connect(&provider.server_addr, provider.server_port) {
                warn!("Unable to connect to tcpq server: {}", e);
            }
        }

        Ok(provider)
    }

    /// Registers interest in `channel` with the broker.
    pub fn subscribe(&self, channel: &str) -> Result<(), SubscribeError> {
        let mut conn = self.conn.lock().unwrap();
        conn.subscriptions.push(channel.to_string());

        if conn.socket.is_none() {
            if let Err(e) = conn.connect(&self.server_addr, self.server_port) {
                warn!("Unable to connect to tcpq server: {}", e);
            }
        } else if let Err(e) = {
            let socket = conn.socket.as_mut().unwrap();
            send_channel_frame(socket, MESSAGE_TYPE_SUBSCRIBE, channel)
        } {
            warn!("Error while subscribing to {}: {}", channel, e);
            conn.disconnect();
        }

        Ok(())
    }

    /// Withdraws interest in `channel`.
    pub fn unsubscribe(&self, channel: &str) {
        let mut conn = self.conn.lock().unwrap();
        match conn.subscriptions.iter().position(|c| c == channel) {
            Some(position) => {
                conn.subscriptions.remove(position);
            }
            None => return,
        }

        if conn.socket.is_none() {
            if let Err(e) = conn.connect(&self.server_addr, self.server_port) {
                warn!("Unable to connect to tcpq server: {}", e);
            }
        } else if let Err(e) = {
            let socket = conn.socket.as_mut().unwrap();
            send_channel_frame(socket, MESSAGE_TYPE_UNSUBSCRIBE, channel)
        } {
            warn!("Error while unsubscribing from {}: {}", channel, e);
            conn.disconnect();
        }
    }

    /// Sends one publish frame to the broker.
    pub fn publish(&self, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        let mut conn = self.conn.lock().unwrap();
        let result = {
            let socket = conn
                .ensure_connected(&self.server_addr, self.server_port)
                .map_err(PublishError::IoError)?;
            send_channel_frame(socket, MESSAGE_TYPE_PUBLISH, channel).and_then(|_| {
                socket.write_u32::<NetworkEndian>(data.len() as u32)?;
                socket.write_all(data)
            })
        };

        if let Err(e) = result {
            conn.disconnect();
            return Err(PublishError::IoError(e));
        }
        Ok(())
    }

    /// Reads one message frame off the socket and dispatches it.
    pub fn handle(&self) -> Result<(), HandleError> {
        // The frame is read into owned buffers and the connection lock is
        // released before dispatch, so callbacks may publish.
        let (channel, data) = {
            let mut conn = self.conn.lock().unwrap();
            let result = {
                let socket = conn
                    .ensure_connected(&self.server_addr, self.server_port)
                    .map_err(HandleError::IoError)?;
                read_message_frame(socket)
            };
            match result {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("tcpq read failed: {}", e);
                    conn.disconnect();
                    return Err(HandleError::Disconnected);
                }
            }
        };

        let recv_utime = utils::timestamp_now();
        if self.registry.try_enqueue_message(&channel) {
            self.registry.dispatch(&channel, &data, recv_utime);
        }
        Ok(())
    }

    /// The broker socket itself; there is no notify pipe for this
    /// provider.
    pub fn fileno(&self) -> Result<RawFd, HandleError> {
        let mut conn = self.conn.lock().unwrap();
        let socket = conn
            .ensure_connected(&self.server_addr, self.server_port)
            .map_err(HandleError::IoError)?;
        Ok(socket.as_raw_fd())
    }
}

/// Writes `message_type`, then the length-prefixed channel name.
fn send_channel_frame(socket: &mut TcpStream, message_type: u32, channel: &str) -> io::Result<()> {
    socket.write_u32::<NetworkEndian>(message_type)?;
    socket.write_u32::<NetworkEndian>(channel.len() as u32)?;
    socket.write_all(channel.as_bytes())?;
    Ok(())
}

/// Reads one inbound publish frame: type, channel, payload.
fn read_message_frame(socket: &mut TcpStream) -> io::Result<(String, Vec<u8>)> {
    // The message type is read and ignored; the broker only pushes
    // publishes.
    let _message_type = socket.read_u32::<NetworkEndian>()?;

    let channel_len = socket.read_u32::<NetworkEndian>()?;
    if channel_len > MAX_FRAME_CHANNEL_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "tcpq channel length out of range",
        ));
    }
    let mut channel = vec![0u8; channel_len as usize];
    socket.read_exact(&mut channel)?;
    let channel = String::from_utf8(channel)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid channel name"))?;

    let data_len = socket.read_u32::<NetworkEndian>()?;
    if data_len as usize > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "tcpq payload length out of range",
        ));
    }
    let mut data = vec![0u8; data_len as usize];
    socket.read_exact(&mut data)?;

    Ok((channel, data))
}

/// Parses `host[:port]`, defaulting to the local broker port.
fn parse_target(network: &str) -> Result<(String, u16), InitError> {
    if network.is_empty() {
        return Ok((DEFAULT_SERVER_ADDR.to_string(), DEFAULT_SERVER_PORT));
    }

    match network.find(':') {
        Some(position) => {
            let host = &network[..position];
            let port = network[position + 1..]
                .parse()
                .map_err(|_| InitError::BadNetworkTarget(network.into()))?;
            let host = if host.is_empty() {
                DEFAULT_SERVER_ADDR
            } else {
                host
            };
            Ok((host.to_string(), port))
        }
        None => Ok((network.to_string(), DEFAULT_SERVER_PORT)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_parsing() {
        assert_eq!(
            parse_target("").unwrap(),
            ("127.0.0.1".to_string(), 7700)
        );
        assert_eq!(
            parse_target("broker.local").unwrap(),
            ("broker.local".to_string(), 7700)
        );
        assert_eq!(
            parse_target("10.1.2.3:8800").unwrap(),
            ("10.1.2.3".to_string(), 8800)
        );
        assert!(parse_target("host:notaport").is_err());
    }
}
