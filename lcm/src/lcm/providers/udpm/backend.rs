//! The receive side of the UDPM provider.
//!
//! A `Backend` runs on its own thread for the life of the provider. It
//! lands datagrams in ring arena slots, reassembles fragmented messages,
//! and hands complete messages to the dispatch entry through the filled
//! queue, poking the notify pipe on each empty-to-nonempty transition.

use std::io;
use std::net::UdpSocket;
use std::os::fd::{AsFd, OwnedFd};
use std::str;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, NetworkEndian};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::buffers::{allocate_buf, Buf, Storage};
use super::fragments::{FragmentBuffer, FragmentStore};
use super::{Shared, FRAG_HEADER_SIZE, MAGIC_LONG, MAGIC_SHORT, SHORT_HEADER_SIZE};
use lcm::registry::Registry;
use lcm::{MAX_CHANNEL_NAME_LENGTH, MAX_MESSAGE_SIZE};
use utils;

/// The LCM backend used for receiving UDPM messages without blocking the
/// main thread.
pub struct Backend {
    /// The multicast socket used for receiving datagrams.
    socket: UdpSocket,
    /// Queues and arena shared with the dispatch entry.
    shared: Arc<Mutex<Shared>>,
    registry: Arc<Registry>,
    /// Becomes readable when the provider wants this thread to exit.
    control_rd: OwnedFd,
    /// Poked once per empty-to-nonempty transition of the filled queue.
    notify_wr: OwnedFd,
    /// Partially reassembled messages.
    fragments: FragmentStore,

    kernel_rbuf_sz: usize,
    warned_about_small_kernel_buf: bool,

    /// Packets received and processed.
    udp_rx: u32,
    /// Packets discarded because they were bad somehow.
    udp_discarded_bad: u32,
}

impl Backend {
    pub fn new(
        socket: UdpSocket,
        shared: Arc<Mutex<Shared>>,
        registry: Arc<Registry>,
        control_rd: OwnedFd,
        notify_wr: OwnedFd,
        fragments: FragmentStore,
        kernel_rbuf_sz: usize,
    ) -> Backend {
        Backend {
            socket,
            shared,
            registry,
            control_rd,
            notify_wr,
            fragments,
            kernel_rbuf_sz,
            warned_about_small_kernel_buf: false,
            udp_rx: 0,
            udp_discarded_bad: 0,
        }
    }

    /// Enter the `Backend` execution loop.
    ///
    /// Waits for datagrams and queues every complete message for the
    /// dispatch entry. Returns when the provider signals the control pipe.
    pub fn run(mut self) -> io::Result<()> {
        loop {
            let buf = match self.read_packet()? {
                Some(buf) => buf,
                None => break,
            };

            let mut shared = self.shared.lock().unwrap();
            // Only one character goes in the pipe at a time to keep the
            // write from ever blocking, so poke only on the transition
            // from empty to non-empty.
            if shared.inbufs_filled.is_empty() {
                utils::poke_fd(&self.notify_wr);
            }
            shared.inbufs_filled.enqueue(buf);
        }

        debug!(
            "Read thread exiting ({} messages, {} bad packets)",
            self.udp_rx, self.udp_discarded_bad
        );
        Ok(())
    }

    /// Reads datagrams until one completes a message.
    ///
    /// Returns `None` when the control pipe signals shutdown.
    fn read_packet(&mut self) -> io::Result<Option<Box<Buf>>> {
        let mut lcmb: Option<Box<Buf>> = None;
        let mut packet_size = 0;

        loop {
            // Wait for either incoming UDP data or an exit command.
            {
                let mut fds = [
                    PollFd::new(self.socket.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.control_rd.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(io::Error::from(e)),
                }

                let control_ready = fds[1]
                    .revents()
                    .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                    .unwrap_or(false);
                if control_ready {
                    debug!("Read thread received exit command");
                    if let Some(mut buf) = lcmb {
                        buf.free_data();
                        self.shared.lock().unwrap().inbufs_empty.enqueue(buf);
                    }
                    return Ok(None);
                }

                let socket_ready = fds[0]
                    .revents()
                    .map(|r| r.contains(PollFlags::POLLIN))
                    .unwrap_or(false);
                if !socket_ready {
                    continue;
                }
            }

            if lcmb.is_none() {
                let mut shared = self.shared.lock().unwrap();
                let shared = &mut *shared;
                lcmb = Some(allocate_buf(&mut shared.inbufs_empty, &mut shared.arena));
            }
            let buf = lcmb.as_mut().unwrap();

            // Land the datagram directly in the ring slot.
            let (size, from) = match self.socket.recv_from(buf.landing_mut()) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("recv failed: {}", e);
                    self.udp_discarded_bad += 1;
                    continue;
                }
            };

            buf.from = from;
            buf.recv_utime = utils::timestamp_now();

            if size < SHORT_HEADER_SIZE {
                // Too short to be an LCM message.
                self.udp_discarded_bad += 1;
                continue;
            }

            let magic = NetworkEndian::read_u32(&buf.landing()[0..4]);
            let complete = match magic {
                MAGIC_SHORT => self.recv_short_message(buf, size),
                MAGIC_LONG => self.recv_message_fragment(buf, size),
                _ => {
                    debug!("Invalid magic in datagram. Dropping.");
                    self.udp_discarded_bad += 1;
                    continue;
                }
            };

            if complete {
                packet_size = size;
                break;
            }
        }

        let mut buf = lcmb.unwrap();
        // Resize the ring slot to the size actually received so a short
        // message does not pin 64k of the arena. Reassembled messages
        // already traded their slot for the heap buffer.
        if let Storage::Ring { ref arena, offset } = buf.storage {
            arena.shrink_last(offset, packet_size);
        }

        Ok(Some(buf))
    }

    /// Unpacks a single-datagram message in place.
    fn recv_short_message(&mut self, buf: &mut Buf, size: usize) -> bool {
        let channel = {
            let datagram = &buf.landing()[..size];
            match parse_channel(&datagram[SHORT_HEADER_SIZE..]) {
                Some(channel) => channel,
                None => {
                    self.udp_discarded_bad += 1;
                    return false;
                }
            }
        };

        self.udp_rx += 1;

        // If no subscriber has room for the message, drop it now.
        if !self.registry.try_enqueue_message(&channel) {
            return false;
        }

        buf.data_offset = SHORT_HEADER_SIZE + channel.len() + 1;
        buf.data_size = size - buf.data_offset;
        buf.channel = channel;
        true
    }

    /// Folds a fragment into its buffer; true once the last fragment of a
    /// wanted message has arrived.
    fn recv_message_fragment(&mut self, buf: &mut Buf, size: usize) -> bool {
        let (msg_seqno, data_size, fragment_offset, fragments_in_msg) = {
            let header = &buf.landing()[..FRAG_HEADER_SIZE];
            (
                NetworkEndian::read_u32(&header[4..8]),
                NetworkEndian::read_u32(&header[8..12]) as usize,
                NetworkEndian::read_u32(&header[12..16]) as usize,
                NetworkEndian::read_u16(&header[18..20]),
            )
        };
        let fragment_no = NetworkEndian::read_u16(&buf.landing()[16..18]);
        let from = buf.from;

        // Discard any stale fragments from previous messages.
        let stale = match self.fragments.get(&from) {
            Some(fbuf) => fbuf.msg_seqno != msg_seqno || fbuf.data.len() != data_size,
            None => false,
        };
        if stale {
            let dropped = self.fragments.remove(&from).unwrap();
            debug!(
                "Dropping message from {} (missing {} fragments)",
                from, dropped.fragments_remaining
            );
        }

        if data_size > MAX_MESSAGE_SIZE {
            debug!("Rejecting huge message ({} bytes)", data_size);
            return false;
        }

        let mut payload_start = FRAG_HEADER_SIZE;

        if self.fragments.get(&from).is_none() {
            // A fragment train can only start at fragment 0; anything else
            // means we came in late and the message is forfeit.
            if fragment_no != 0 {
                return false;
            }

            let channel = {
                let datagram = &buf.landing()[..size];
                match parse_channel(&datagram[FRAG_HEADER_SIZE..]) {
                    Some(channel) => channel,
                    None => {
                        self.udp_discarded_bad += 1;
                        return false;
                    }
                }
            };
            payload_start += channel.len() + 1;

            // If the message has no subscribers, skip the whole train.
            if !self.registry.has_handlers(&channel) {
                return false;
            }

            self.fragments.add(FragmentBuffer {
                channel,
                from,
                data: vec![0; data_size],
                fragments_remaining: fragments_in_msg,
                msg_seqno,
                first_packet_utime: buf.recv_utime,
                last_packet_utime: buf.recv_utime,
            });
        }

        #[cfg(target_os = "linux")]
        {
            if self.kernel_rbuf_sz < 262145
                && data_size > self.kernel_rbuf_sz
                && !self.warned_about_small_kernel_buf
            {
                warn!(
                    "Large packets are being received, but the kernel UDP receive buffer is very \
                     small ({} bytes). Packet loss is likely; consider raising net.core.rmem_max.",
                    self.kernel_rbuf_sz
                );
                self.warned_about_small_kernel_buf = true;
            }
        }

        let frag_size = size - payload_start;
        let total_size = match self.fragments.get(&from) {
            Some(fbuf) => fbuf.data.len(),
            None => return false,
        };
        if fragment_offset + frag_size > total_size {
            debug!(
                "Dropping invalid fragment (offset {}, size {} / {})",
                fragment_offset, frag_size, total_size
            );
            self.fragments.remove(&from);
            return false;
        }

        // Copy the fragment payload into place.
        if let Some(fbuf) = self.fragments.get_mut(&from) {
            fbuf.data[fragment_offset..fragment_offset + frag_size]
                .copy_from_slice(&buf.landing()[payload_start..size]);
            fbuf.fragments_remaining -= 1;
        }
        self.fragments.touch(&from, buf.recv_utime);

        let done = self
            .fragments
            .get(&from)
            .map(|fbuf| fbuf.fragments_remaining == 0)
            .unwrap_or(false);
        if !done {
            return false;
        }

        // Complete message. Is there a subscriber that still wants it?
        let fbuf = match self.fragments.remove(&from) {
            Some(fbuf) => fbuf,
            None => return false,
        };
        if !self.registry.try_enqueue_message(&fbuf.channel) {
            return false;
        }

        self.udp_rx += 1;

        // Trade the ring landing slot for the reassembled heap buffer.
        buf.free_data();
        buf.channel = fbuf.channel;
        buf.data_offset = 0;
        buf.data_size = fbuf.data.len();
        buf.recv_utime = fbuf.last_packet_utime;
        buf.storage = Storage::Heap(fbuf.data);
        true
    }
}

/// Reads a NUL-terminated channel name from the front of `bytes`.
pub fn parse_channel(bytes: &[u8]) -> Option<String> {
    let end = match bytes.iter().position(|&b| b == 0) {
        Some(end) => end,
        None => {
            debug!("Unable to parse channel name in datagram. Dropping.");
            return None;
        }
    };
    if end > MAX_CHANNEL_NAME_LENGTH {
        debug!("Bad channel name length. Dropping.");
        return None;
    }
    match str::from_utf8(&bytes[..end]) {
        Ok(channel) => Some(channel.to_string()),
        Err(_) => {
            debug!("Invalid UTF-8 in channel name. Dropping.");
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::buffers::BufQueue;
    use super::super::fragments::{MAX_FRAG_BUF_TOTAL_SIZE, MAX_NUM_FRAG_BUFS};
    use super::super::ringbuf::RingArena;
    use super::super::{FRAGMENT_MAX_PAYLOAD, RINGBUF_SIZE};
    use super::*;
    use byteorder::WriteBytesExt;
    use utils::Pipe;

    fn test_backend(registry: Arc<Registry>) -> Backend {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let shared = Arc::new(Mutex::new(Shared {
            arena: Arc::new(RingArena::new(RINGBUF_SIZE)),
            inbufs_empty: BufQueue::new(),
            inbufs_filled: BufQueue::new(),
        }));
        let (control_rd, _control_wr) = Pipe::notify().unwrap().split();
        let notify_wr = Pipe::notify().unwrap().split().1;
        Backend::new(
            socket,
            shared,
            registry,
            control_rd,
            notify_wr,
            FragmentStore::new(MAX_FRAG_BUF_TOTAL_SIZE, MAX_NUM_FRAG_BUFS),
            0,
        )
    }

    fn landing_buf() -> (Box<Buf>, ::std::sync::Arc<RingArena>) {
        let mut empty = BufQueue::new();
        let mut arena = Arc::new(RingArena::new(RINGBUF_SIZE));
        (allocate_buf(&mut empty, &mut arena), arena)
    }

    fn sender() -> ::std::net::SocketAddr {
        "127.0.0.1:45678".parse().unwrap()
    }

    fn short_datagram(seqno: u32, channel: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<NetworkEndian>(MAGIC_SHORT).unwrap();
        out.write_u32::<NetworkEndian>(seqno).unwrap();
        out.extend_from_slice(channel.as_bytes());
        out.push(0);
        out.extend_from_slice(data);
        out
    }

    /// Builds the same fragment train `send_fragments` would emit.
    fn fragment_datagrams(seqno: u32, channel: &str, data: &[u8]) -> Vec<Vec<u8>> {
        let payload_size = channel.len() + 1 + data.len();
        let nfragments = payload_size / FRAGMENT_MAX_PAYLOAD
            + (payload_size % FRAGMENT_MAX_PAYLOAD != 0) as usize;

        let mut datagrams = Vec::new();
        let mut fragment_offset = 0usize;
        for fragment_no in 0..nfragments {
            let mut out = Vec::new();
            out.write_u32::<NetworkEndian>(MAGIC_LONG).unwrap();
            out.write_u32::<NetworkEndian>(seqno).unwrap();
            out.write_u32::<NetworkEndian>(data.len() as u32).unwrap();
            out.write_u32::<NetworkEndian>(fragment_offset as u32).unwrap();
            out.write_u16::<NetworkEndian>(fragment_no as u16).unwrap();
            out.write_u16::<NetworkEndian>(nfragments as u16).unwrap();

            let fragment_len = if fragment_no == 0 {
                out.extend_from_slice(channel.as_bytes());
                out.push(0);
                FRAGMENT_MAX_PAYLOAD - (channel.len() + 1)
            } else {
                (data.len() - fragment_offset).min(FRAGMENT_MAX_PAYLOAD)
            };
            out.extend_from_slice(&data[fragment_offset..fragment_offset + fragment_len]);
            fragment_offset += fragment_len;
            datagrams.push(out);
        }
        assert_eq!(fragment_offset, data.len());
        datagrams
    }

    fn feed(backend: &mut Backend, buf: &mut Buf, datagram: &[u8]) -> bool {
        buf.landing_mut()[..datagram.len()].copy_from_slice(datagram);
        buf.from = sender();
        buf.recv_utime = utils::timestamp_now();
        let magic = NetworkEndian::read_u32(&datagram[0..4]);
        match magic {
            MAGIC_SHORT => backend.recv_short_message(buf, datagram.len()),
            MAGIC_LONG => backend.recv_message_fragment(buf, datagram.len()),
            _ => panic!("bad test datagram"),
        }
    }

    #[test]
    fn short_datagram_unpacks_in_place() {
        let registry = Registry::new();
        registry.subscribe("FOO", Box::new(|_| {})).unwrap();
        let mut backend = test_backend(registry);
        let (mut buf, _arena) = landing_buf();

        let datagram = short_datagram(7, "FOO", b"hello");
        assert!(feed(&mut backend, &mut buf, &datagram));
        assert_eq!(buf.channel, "FOO");
        assert_eq!(buf.payload(), b"hello");
    }

    #[test]
    fn short_datagram_without_subscribers_is_dropped() {
        let registry = Registry::new();
        let mut backend = test_backend(registry);
        let (mut buf, _arena) = landing_buf();

        let datagram = short_datagram(7, "NOBODY", b"hello");
        assert!(!feed(&mut backend, &mut buf, &datagram));
    }

    #[test]
    fn fragments_reassemble_exactly() {
        let registry = Registry::new();
        registry.subscribe("X", Box::new(|_| {})).unwrap();
        let mut backend = test_backend(registry);
        let (mut buf, arena) = landing_buf();

        let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let datagrams = fragment_datagrams(3, "X", &data);
        assert_eq!(datagrams.len(), 4);

        for (i, datagram) in datagrams.iter().enumerate() {
            let complete = feed(&mut backend, &mut buf, datagram);
            assert_eq!(complete, i == datagrams.len() - 1);
        }

        assert_eq!(buf.channel, "X");
        assert_eq!(buf.data_size, data.len());
        assert!(buf.payload() == &data[..]);
        // The landing slot went back to the arena when the payload moved
        // to its heap buffer.
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn out_of_order_first_fragment_forfeits_the_message() {
        let registry = Registry::new();
        registry.subscribe("X", Box::new(|_| {})).unwrap();
        let mut backend = test_backend(registry);
        let (mut buf, _arena) = landing_buf();

        let data = vec![42u8; 100_000];
        let datagrams = fragment_datagrams(3, "X", &data);

        // Fragment 1 with no buffer in progress is ignored, and the rest
        // of the train never completes.
        for datagram in datagrams.iter().skip(1) {
            assert!(!feed(&mut backend, &mut buf, datagram));
        }
        assert_eq!(backend.fragments.len(), 0);
    }

    #[test]
    fn new_sequence_number_evicts_stale_partial() {
        let registry = Registry::new();
        registry.subscribe("X", Box::new(|_| {})).unwrap();
        let mut backend = test_backend(registry);
        let (mut buf, _arena) = landing_buf();

        let old = vec![1u8; 100_000];
        let new = vec![2u8; 100_000];
        let old_datagrams = fragment_datagrams(3, "X", &old);
        let new_datagrams = fragment_datagrams(4, "X", &new);

        assert!(!feed(&mut backend, &mut buf, &old_datagrams[0]));
        assert_eq!(backend.fragments.len(), 1);

        // A fresh train from the same sender replaces the stale one.
        for (i, datagram) in new_datagrams.iter().enumerate() {
            let complete = feed(&mut backend, &mut buf, datagram);
            assert_eq!(complete, i == new_datagrams.len() - 1);
        }
        assert!(buf.payload() == &new[..]);
    }

    #[test]
    fn invalid_fragment_offset_drops_the_buffer() {
        let registry = Registry::new();
        registry.subscribe("X", Box::new(|_| {})).unwrap();
        let mut backend = test_backend(registry);
        let (mut buf, _arena) = landing_buf();

        let data = vec![9u8; 100_000];
        let mut datagrams = fragment_datagrams(3, "X", &data);
        assert!(!feed(&mut backend, &mut buf, &datagrams[0]));

        // Corrupt the second fragment's offset to point past the end.
        NetworkEndian::write_u32(&mut datagrams[1][12..16], data.len() as u32);
        assert!(!feed(&mut backend, &mut buf, &datagrams[1]));
        assert_eq!(backend.fragments.len(), 0);
    }

    #[test]
    fn channel_names_are_validated() {
        assert_eq!(parse_channel(b"GOOD\0rest"), Some("GOOD".to_string()));
        assert_eq!(parse_channel(b"no terminator"), None);
        assert_eq!(parse_channel(&[0xffu8, 0xfe, 0x00]), None);

        let long = [b'a'; 70];
        let mut with_nul = long.to_vec();
        with_nul.push(0);
        assert_eq!(parse_channel(&with_nul), None);
    }
}
