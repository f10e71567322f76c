//! The UDP multicast provider.
//!
//! Messages travel as multicast datagrams: short messages in a single
//! datagram, large ones split into fragments that are reassembled on the
//! receiving side. A background thread owns the receive socket and queues
//! complete messages for the application, which drains them one per
//! `handle` call.

use std::cell::Cell;
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{NetworkEndian, WriteBytesExt};
use nix::sys::socket::{getsockopt, setsockopt, sockopt};

mod backend;
mod buffers;
mod fragments;
mod ringbuf;

use self::backend::Backend;
use self::buffers::{Buf, BufQueue, DEFAULT_RECV_BUFS};
use self::fragments::{FragmentStore, MAX_FRAG_BUF_TOTAL_SIZE, MAX_NUM_FRAG_BUFS};
use self::ringbuf::RingArena;
use error::*;
use lcm::registry::Registry;
use lcm::{MAX_CHANNEL_NAME_LENGTH, MAX_MESSAGE_SIZE};
use utils::{self, Pipe};

/// Magic number for single-datagram messages. Hex for ASCII "LC02".
const MAGIC_SHORT: u32 = 0x4c43_3032;
/// Magic number for message fragments. Hex for ASCII "LC03".
const MAGIC_LONG: u32 = 0x4c43_3033;

const SHORT_HEADER_SIZE: usize = 8;
const FRAG_HEADER_SIZE: usize = 20;

/// Largest `channel + NUL + payload` that still goes out unfragmented.
#[cfg(not(target_os = "macos"))]
const SHORT_MESSAGE_MAX_SIZE: usize = 65499;
#[cfg(target_os = "macos")]
const SHORT_MESSAGE_MAX_SIZE: usize = 1435;

/// Largest datagram body (channel prefix included on fragment 0) of a
/// single fragment.
#[cfg(not(target_os = "macos"))]
const FRAGMENT_MAX_PAYLOAD: usize = 65487;
#[cfg(target_os = "macos")]
const FRAGMENT_MAX_PAYLOAD: usize = 1423;

/// Size of the initial receive landing arena.
const RINGBUF_SIZE: usize = 200 * 1024;

/// Channel used for the startup round-trip probe.
const SELF_TEST_CHANNEL: &str = "LCM_SELF_TEST";
const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SELF_TEST_RETRANSMIT: Duration = Duration::from_millis(100);

const DEFAULT_MC_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 76, 67);
const DEFAULT_MC_PORT: u16 = 7667;

thread_local! {
    /// Marks the thread that is currently allocating receive resources, so
    /// that its own re-entrant `handle` calls (from the self test) pass
    /// straight through `setup_recv_parts`.
    static CREATING_RECV_PARTS: Cell<bool> = Cell::new(false);
}

#[derive(Debug, Clone, Copy)]
struct UdpmParams {
    mc_addr: Ipv4Addr,
    mc_port: u16,
    /// 0 keeps packets on this host; 1 keeps them on the local network.
    ttl: u32,
    /// Requested kernel receive buffer size; 0 leaves the default.
    recv_buf_size: usize,
}

/// State shared between the receive thread and the dispatch entry.
pub struct Shared {
    pub arena: Arc<RingArena>,
    pub inbufs_empty: BufQueue,
    pub inbufs_filled: BufQueue,
}

/// The receive-side resources, allocated on first subscribe.
struct RecvParts {
    shared: Arc<Mutex<Shared>>,
    /// Write end of the pipe that tells the read thread to quit.
    control_wr: OwnedFd,
    read_thread: Option<thread::JoinHandle<()>>,
}

struct RecvState {
    /// True while some thread is allocating the receive resources.
    creating: bool,
    parts: Option<RecvParts>,
}

/// The UDP multicast provider.
pub struct UdpmProvider {
    registry: Arc<Registry>,
    params: UdpmParams,
    dest: SocketAddr,

    /// The socket used to send datagrams. Deliberately not `connect`ed;
    /// Linux stops looping multicast back to localhost otherwise.
    send_socket: UdpSocket,
    /// Sequence number for outgoing messages. Its mutex doubles as the
    /// transmit lock and is held for the whole fragment train of one
    /// message.
    seqno: Mutex<u32>,

    /// Poked by the read thread each time the filled queue goes
    /// empty-to-nonempty; the application blocks reading it in `handle`.
    notify_pipe: Pipe,

    recv: Mutex<RecvState>,
    recv_cond: Condvar,
    /// Set while the provider is probing itself; `handle` then delivers
    /// only self-test traffic.
    in_self_test: AtomicBool,
}

impl UdpmProvider {
    /// Creates a new UDPM provider using the given settings.
    pub fn new(
        registry: Arc<Registry>,
        network: &str,
        options: &HashMap<&str, &str>,
    ) -> Result<UdpmProvider, InitError> {
        let params = UdpmParams::parse(network, options)?;
        let dest = SocketAddr::new(IpAddr::V4(params.mc_addr), params.mc_port);

        debug!(
            "Starting UDPM provider with multicast (ip = {}, port = {}, ttl = {})",
            params.mc_addr, params.mc_port, params.ttl
        );

        // Probe connectivity first so a missing multicast route fails the
        // context instead of silently black-holing every publish.
        let probe = UdpSocket::bind((Ipv4Addr::new(0, 0, 0, 0), 0))?;
        if let Err(e) = probe.connect(dest) {
            #[cfg(target_os = "linux")]
            check_routing_table(params.mc_addr);
            return Err(InitError::IoError(e));
        }
        drop(probe);

        let send_socket = UdpSocket::bind((Ipv4Addr::new(0, 0, 0, 0), 0))?;
        debug!("Setting multicast packet TTL to {}", params.ttl);
        if params.ttl == 0 {
            debug!("Multicast TTL is 0. Packets will not leave localhost.");
        }
        send_socket.set_multicast_ttl_v4(params.ttl)?;
        debug!("Setting multicast loopback option");
        send_socket.set_multicast_loop_v4(true)?;
        // Membership on the send socket is what makes the kernel deliver
        // our own packets back to us, which the self test depends on.
        debug!("Joining multicast group");
        send_socket.join_multicast_v4(&params.mc_addr, &Ipv4Addr::new(0, 0, 0, 0))?;

        let notify_pipe = Pipe::notify()?;

        Ok(UdpmProvider {
            registry,
            params,
            dest,
            send_socket,
            seqno: Mutex::new(0),
            notify_pipe,
            recv: Mutex::new(RecvState {
                creating: false,
                parts: None,
            }),
            recv_cond: Condvar::new(),
            in_self_test: AtomicBool::new(false),
        })
    }

    /// Called whenever a subscription is made. The first call allocates the
    /// receive resources and runs the self test.
    pub fn subscribe(&self, _channel: &str) -> Result<(), SubscribeError> {
        self.setup_recv_parts()?;
        Ok(())
    }

    /// Publishes a message on the specified channel.
    pub fn publish(&self, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        if channel.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(PublishError::ChannelTooLong(channel.into()));
        }

        let payload_size = channel.len() + 1 + data.len();

        let mut seqno = self.seqno.lock().unwrap();
        if payload_size <= SHORT_MESSAGE_MAX_SIZE {
            self.send_short(*seqno, channel, data)?;
        } else {
            self.send_fragments(*seqno, channel, data)?;
        }
        *seqno = seqno.wrapping_add(1);

        Ok(())
    }

    /// Waits for and dispatches the next incoming message.
    pub fn handle(&self) -> Result<(), HandleError> {
        self.setup_recv_parts()?;

        // Block until the read thread signals a queued message.
        self.notify_pipe.drain_one()?;

        let shared = {
            let state = self.recv.lock().unwrap();
            let parts = match state.parts {
                Some(ref parts) => parts,
                None => return Err(HandleError::SpuriousWakeup),
            };
            parts.shared.clone()
        };

        let mut buf = {
            let mut shared = shared.lock().unwrap();
            let buf = match shared.inbufs_filled.dequeue() {
                Some(buf) => buf,
                None => {
                    error!("No message available despite getting a notification.");
                    return Err(HandleError::SpuriousWakeup);
                }
            };
            // Keep the pipe primed while more messages are waiting.
            if !shared.inbufs_filled.is_empty() {
                self.notify_pipe.poke()?;
            }
            buf
        };

        // While the self test is running, only the self test channel is
        // delivered.
        let deliver =
            !self.in_self_test.load(Ordering::SeqCst) || buf.channel == SELF_TEST_CHANNEL;
        if deliver {
            self.registry
                .dispatch(&buf.channel, buf.payload(), buf.recv_utime);
        }

        let mut shared = shared.lock().unwrap();
        buf.free_data();
        buf.channel.clear();
        shared.inbufs_empty.enqueue(buf);

        Ok(())
    }

    /// The descriptor the application can poll for readiness.
    pub fn fileno(&self) -> Result<RawFd, HandleError> {
        self.setup_recv_parts()?;
        Ok(self.notify_pipe.raw_read_fd())
    }

    /// Sends a message that fits in a single datagram.
    fn send_short(&self, seqno: u32, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        trace!("Sending small datagram on channel \"{}\"", channel);

        let mut buf = Vec::with_capacity(SHORT_HEADER_SIZE + channel.len() + 1 + data.len());

        // Writes to a Vec cannot fail.
        buf.write_u32::<NetworkEndian>(MAGIC_SHORT).unwrap();
        buf.write_u32::<NetworkEndian>(seqno).unwrap();
        buf.extend_from_slice(channel.as_bytes());
        buf.push(0);
        buf.extend_from_slice(data);

        let sent = self.send_socket.send_to(&buf, self.dest)?;
        if sent != buf.len() {
            warn!(
                "The number of bytes sent ({}) did not equal the size of the datagram ({}).",
                sent,
                buf.len()
            );
            return Err(PublishError::ShortSend {
                sent,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    /// Sends a message as a train of fragment datagrams, all carrying the
    /// same sequence number.
    fn send_fragments(&self, seqno: u32, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        let payload_size = channel.len() + 1 + data.len();
        let nfragments =
            payload_size / FRAGMENT_MAX_PAYLOAD + (payload_size % FRAGMENT_MAX_PAYLOAD != 0) as usize;

        if nfragments > u16::max_value() as usize {
            return Err(PublishError::TooManyFragments(nfragments));
        }

        trace!(
            "Sending {} byte [{}] payload in {} fragment datagrams",
            payload_size,
            channel,
            nfragments
        );

        let mut buf = Vec::with_capacity(FRAG_HEADER_SIZE + FRAGMENT_MAX_PAYLOAD);
        let mut fragment_offset = 0usize;

        for fragment_no in 0..nfragments {
            buf.clear();
            buf.write_u32::<NetworkEndian>(MAGIC_LONG).unwrap();
            buf.write_u32::<NetworkEndian>(seqno).unwrap();
            buf.write_u32::<NetworkEndian>(data.len() as u32).unwrap();
            buf.write_u32::<NetworkEndian>(fragment_offset as u32)
                .unwrap();
            buf.write_u16::<NetworkEndian>(fragment_no as u16).unwrap();
            buf.write_u16::<NetworkEndian>(nfragments as u16).unwrap();

            let fragment_len = if fragment_no == 0 {
                // The first fragment carries the channel name ahead of its
                // payload slice.
                buf.extend_from_slice(channel.as_bytes());
                buf.push(0);
                FRAGMENT_MAX_PAYLOAD - (channel.len() + 1)
            } else {
                (data.len() - fragment_offset).min(FRAGMENT_MAX_PAYLOAD)
            };
            buf.extend_from_slice(&data[fragment_offset..fragment_offset + fragment_len]);

            let sent = self.send_socket.send_to(&buf, self.dest)?;
            if sent != buf.len() {
                warn!(
                    "The number of bytes sent ({}) did not equal the size of the datagram ({}).",
                    sent,
                    buf.len()
                );
                return Err(PublishError::ShortSend {
                    sent,
                    expected: buf.len(),
                });
            }

            fragment_offset += fragment_len;
        }
        debug_assert_eq!(fragment_offset, data.len());

        Ok(())
    }

    /// Allocates the receive socket, buffers, and read thread, exactly
    /// once, and gates the provider on a successful self test.
    ///
    /// Threads that arrive while another is mid-setup wait on the condition
    /// variable; the setup thread itself re-enters freely because the self
    /// test drives `handle`.
    fn setup_recv_parts(&self) -> Result<(), InitError> {
        let mut state = self.recv.lock().unwrap();

        if state.creating {
            if CREATING_RECV_PARTS.with(|c| c.get()) {
                return Ok(());
            }
            while state.creating {
                state = self.recv_cond.wait(state).unwrap();
            }
            return if state.parts.is_some() {
                Ok(())
            } else {
                Err(InitError::SelfTestFailed)
            };
        }
        if state.parts.is_some() {
            return Ok(());
        }

        // Claim the setup for this thread.
        state.creating = true;
        CREATING_RECV_PARTS.with(|c| c.set(true));
        drop(state);

        debug!("Allocating resources for receiving messages");
        let result = self.create_recv_parts().and_then(|_| self.self_test());

        let mut state = self.recv.lock().unwrap();
        match result {
            Ok(()) => debug!("Self test successful"),
            Err(ref e) => {
                error!(
                    "LCM self test failed ({}). Check routing tables and firewall settings.",
                    e
                );
                if let Some(parts) = state.parts.take() {
                    UdpmProvider::shutdown_parts(parts);
                }
            }
        }
        state.creating = false;
        CREATING_RECV_PARTS.with(|c| c.set(false));
        self.recv_cond.notify_all();
        drop(state);

        result
    }

    fn create_recv_parts(&self) -> Result<(), InitError> {
        use net2::UdpBuilder;

        let builder = UdpBuilder::new_v4()?;

        debug!("Setting SO_REUSEADDR");
        builder.reuse_address(true)?;

        // Mac OS and FreeBSD also require SO_REUSEPORT before multiple
        // processes may bind the same multicast port.
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        {
            use net2::unix::UnixUdpBuilderExt;
            debug!("Setting SO_REUSEPORT");
            builder.reuse_port(true)?;
        }

        debug!("Binding receive socket");
        let socket = builder.bind((Ipv4Addr::new(0, 0, 0, 0), self.params.mc_port))?;

        let mut kernel_rbuf_sz = getsockopt(&socket, sockopt::RcvBuf).unwrap_or(0);
        debug!("Receive buffer is {} bytes", kernel_rbuf_sz);
        if self.params.recv_buf_size != 0 {
            if let Err(e) = setsockopt(&socket, sockopt::RcvBuf, &self.params.recv_buf_size) {
                warn!("Unable to set the kernel receive buffer size: {}", e);
            }
            kernel_rbuf_sz = getsockopt(&socket, sockopt::RcvBuf).unwrap_or(0);
            debug!("Receive buffer is {} bytes", kernel_rbuf_sz);
            if self.params.recv_buf_size > kernel_rbuf_sz {
                warn!(
                    "The kernel granted a receive buffer of {} bytes, less than the {} requested.",
                    kernel_rbuf_sz, self.params.recv_buf_size
                );
            }
        }

        debug!("Joining multicast group");
        socket.join_multicast_v4(&self.params.mc_addr, &Ipv4Addr::new(0, 0, 0, 0))?;
        socket.set_nonblocking(true)?;

        let mut inbufs_empty = BufQueue::new();
        for _ in 0..DEFAULT_RECV_BUFS {
            // The descriptors get their data pointers from the ring arena
            // at receive time.
            inbufs_empty.enqueue(Box::new(Buf::new()));
        }
        let shared = Arc::new(Mutex::new(Shared {
            arena: Arc::new(RingArena::new(RINGBUF_SIZE)),
            inbufs_empty,
            inbufs_filled: BufQueue::new(),
        }));

        let control_pipe = Pipe::notify()?;
        let (control_rd, control_wr) = control_pipe.split();

        let backend = Backend::new(
            socket,
            shared.clone(),
            self.registry.clone(),
            control_rd,
            self.notify_pipe.clone_writer()?,
            FragmentStore::new(MAX_FRAG_BUF_TOTAL_SIZE, MAX_NUM_FRAG_BUFS),
            kernel_rbuf_sz,
        );

        debug!("Starting read thread");
        let read_thread = thread::Builder::new()
            .name("lcm-udpm-recv".into())
            .spawn(move || {
                if let Err(e) = backend.run() {
                    error!("Read thread failed with message: {}", e);
                }
            })?;

        let mut state = self.recv.lock().unwrap();
        state.parts = Some(RecvParts {
            shared,
            control_wr,
            read_thread: Some(read_thread),
        });

        Ok(())
    }

    /// Publishes on a private channel and spins until the message comes
    /// back through the full receive path.
    fn self_test(&self) -> Result<(), InitError> {
        debug!("Conducting self test");
        self.in_self_test.store(true, Ordering::SeqCst);

        let success = Arc::new(AtomicBool::new(false));
        let subscription = {
            let success = success.clone();
            self.registry
                .subscribe(
                    SELF_TEST_CHANNEL,
                    Box::new(move |_| {
                        success.store(true, Ordering::SeqCst);
                    }),
                )
                .map_err(|_| InitError::SelfTestFailed)?
        };

        let payload = b"lcm self test";
        let deadline = Instant::now() + SELF_TEST_TIMEOUT;
        let mut next_retransmit = Instant::now();

        while !success.load(Ordering::SeqCst) && Instant::now() < deadline {
            let now = Instant::now();
            if now >= next_retransmit {
                // Retransmit periodically, just in case.
                if let Err(e) = self.publish(SELF_TEST_CHANNEL, payload) {
                    warn!("Self test publish failed: {}", e);
                }
                next_retransmit = now + SELF_TEST_RETRANSMIT;
            }

            let timeout = next_retransmit.saturating_duration_since(Instant::now());
            let readable = utils::wait_readable(self.notify_pipe.read_fd(), Some(timeout))
                .map_err(InitError::IoError)?;
            if readable {
                if let Err(e) = self.handle() {
                    warn!("Self test handle failed: {}", e);
                }
            }
        }

        let _ = subscription.unsubscribe();
        self.in_self_test.store(false, Ordering::SeqCst);
        debug!("Self test complete");

        if success.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InitError::SelfTestFailed)
        }
    }

    fn shutdown_parts(mut parts: RecvParts) {
        // One byte on the control pipe tells the read thread to exit.
        utils::poke_fd(&parts.control_wr);
        if let Some(thread) = parts.read_thread.take() {
            if thread.join().is_err() {
                warn!("The read thread panicked during shutdown.");
            }
        }
    }
}

impl Drop for UdpmProvider {
    fn drop(&mut self) {
        debug!("Closing UDPM provider");
        let parts = self.recv.lock().unwrap().parts.take();
        if let Some(parts) = parts {
            UdpmProvider::shutdown_parts(parts);
        }
    }
}

impl UdpmParams {
    /// Builds the provider parameters from, in increasing priority: the
    /// compiled-in defaults, the `LCM_MCADDR` and `LCM_TTL` environment
    /// variables, the network portion of the URL, and the URL options.
    fn parse(network: &str, options: &HashMap<&str, &str>) -> Result<UdpmParams, InitError> {
        let mut params = UdpmParams {
            mc_addr: DEFAULT_MC_ADDR,
            mc_port: DEFAULT_MC_PORT,
            ttl: 0,
            recv_buf_size: 0,
        };

        if let Ok(env_addr) = env::var("LCM_MCADDR") {
            debug!("Using multicast address from the environment: {}", env_addr);
            params.apply_target(&env_addr)?;
        }
        if let Ok(env_ttl) = env::var("LCM_TTL") {
            match env_ttl.parse() {
                Ok(ttl) => params.ttl = ttl,
                Err(_) => warn!("Ignoring invalid LCM_TTL value \"{}\"", env_ttl),
            }
        }

        params.apply_target(network)?;

        for (key, value) in options {
            match *key {
                "ttl" => match value.parse() {
                    Ok(ttl) => params.ttl = ttl,
                    Err(_) => warn!("Ignoring invalid value for ttl"),
                },
                "recv_buf_size" => match value.parse() {
                    Ok(size) => params.recv_buf_size = size,
                    Err(_) => warn!("Ignoring invalid value for recv_buf_size"),
                },
                _ => warn!("Ignoring unknown provider option \"{}\"", key),
            }
        }

        Ok(params)
    }

    /// Applies an `address[:port]` target string, leaving blank pieces
    /// untouched.
    fn apply_target(&mut self, target: &str) -> Result<(), InitError> {
        if target.is_empty() {
            return Ok(());
        }

        let (addr, port) = match target.find(':') {
            Some(p) => (&target[..p], Some(&target[p + 1..])),
            None => (target, None),
        };

        if !addr.is_empty() {
            self.mc_addr = addr
                .parse()
                .map_err(|_| InitError::BadNetworkTarget(target.into()))?;
        }
        if let Some(port) = port {
            self.mc_port = port
                .parse()
                .map_err(|_| InitError::BadNetworkTarget(target.into()))?;
        }
        Ok(())
    }
}

/// Checks `/proc/net/route` for a route covering the multicast address and
/// explains how to add one when it is missing.
#[cfg(target_os = "linux")]
fn check_routing_table(mc_addr: Ipv4Addr) {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let routes = match File::open("/proc/net/route") {
        Ok(f) => f,
        Err(e) => {
            warn!("Unable to open the routing table: {}", e);
            return;
        }
    };

    // The hex fields in /proc/net/route are in host (little-endian) byte
    // order, so the multicast address is converted to match.
    let mc_bits = u32::from_le_bytes(mc_addr.octets());

    for line in BufReader::new(routes).lines().skip(1) {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let words: Vec<&str> = line.split('\t').collect();
        if words.len() < 8 {
            continue;
        }
        let dest = u32::from_str_radix(words[1], 16);
        let mask = u32::from_str_radix(words[7], 16);
        if let (Ok(dest), Ok(mask)) = (dest, mask) {
            if mc_bits & mask == dest & mask {
                // A usable multicast route exists; the failure was
                // something else.
                return;
            }
        }
    }

    warn!(
        "No route to {}. LCM requires a valid multicast route. If this is a Linux computer \
         that is simply not connected to a network, the following commands are usually \
         sufficient as a temporary solution:\n\
         \n\
         \tsudo ifconfig lo multicast\n\
         \tsudo route add -net 224.0.0.0 netmask 240.0.0.0 dev lo\n",
        mc_addr
    );
}
