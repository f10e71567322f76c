//! From the [LCM Homepage](http://lcm-proj.github.io/):
//! >
//! LCM is a set of libraries and tools for message passing and data marshalling,
//! targeted at real-time systems where high-bandwidth and low latency are critical.
//! It provides a publish/subscribe message passing model
//! and automatic marshalling/unmarshalling code generation
//! with bindings for applications in a variety of programming languages.
//!
//! This crate provides the LCM transport layer: channel-tagged
//! publish/subscribe of opaque byte payloads over UDP multicast, plus the
//! event log codec and the log playback, TCP queue, and in-memory
//! providers. Marshalling of message types is out of scope; payloads are
//! `&[u8]` in both directions.
//!
//! ```no_run
//! use lcm::Lcm;
//!
//! let lcm = Lcm::new().unwrap();
//! let _sub = lcm
//!     .subscribe("POSITION", |rbuf| {
//!         println!("{} bytes on {}", rbuf.data.len(), rbuf.channel);
//!     })
//!     .unwrap();
//! lcm.publish("POSITION", &[1, 2, 3]).unwrap();
//! loop {
//!     lcm.handle().unwrap();
//! }
//! ```

#[macro_use]
extern crate log;

extern crate byteorder;
#[macro_use]
extern crate failure;
extern crate net2;
extern crate nix;
extern crate regex;

mod utils;

pub mod error;
pub mod eventlog;

mod lcm;
pub use lcm::{Lcm, RecvBuf, Subscription};
pub use lcm::{MAX_CHANNEL_NAME_LENGTH, MAX_MESSAGE_SIZE};
