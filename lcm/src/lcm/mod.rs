//! The LCM context and its provider plumbing.

use std::collections::HashMap;
use std::env;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) mod registry;
mod providers;

pub use self::registry::{RecvBuf, Subscription};
use self::registry::Registry;

#[cfg(feature = "file")]
use self::providers::file::FileProvider;
#[cfg(feature = "memq")]
use self::providers::memq::MemqProvider;
#[cfg(feature = "tcpq")]
use self::providers::tcpq::TcpqProvider;
#[cfg(feature = "udpm")]
use self::providers::udpm::UdpmProvider;

use error::*;
use utils;

/// Convenience macro for dispatching functions among providers.
macro_rules! provider {
    ($self:ident.$func:ident($($args:expr),*)) => {
        match $self.provider {
            #[cfg(feature = "udpm")]
            Provider::Udpm(ref p) => p.$func($($args),*),

            #[cfg(feature = "file")]
            Provider::File(ref p) => p.$func($($args),*),

            #[cfg(feature = "tcpq")]
            Provider::Tcpq(ref p) => p.$func($($args),*),

            #[cfg(feature = "memq")]
            Provider::Memq(ref p) => p.$func($($args),*),
        }
    }
}

/// Default LCM URL to be used when the `LCM_DEFAULT_URL` environment
/// variable is not available.
const LCM_DEFAULT_URL: &str = "udpm://239.255.76.67:7667?ttl=0";

/// Longest permitted channel name, excluding the NUL terminator.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 63;

/// Cap on the size of a single message.
pub const MAX_MESSAGE_SIZE: usize = 1 << 28; // 256 MiB

/// An LCM instance: one provider plus the subscriptions it feeds.
///
/// All methods take `&self`; a single instance may be shared across
/// threads, with publishes serialized by the provider's transmit lock and
/// `handle` calls serialized by the dispatch lock. Dropping the instance
/// joins the provider's background threads before releasing the
/// subscriptions.
pub struct Lcm {
    // Field order matters: the provider must shut down while the registry
    // it feeds is still alive.
    provider: Provider,
    registry: Arc<Registry>,
    /// Only one thread is allowed in `handle` at a time.
    handle_mutex: Mutex<()>,
}

impl Lcm {
    /// Creates a new `Lcm` instance.
    ///
    /// This uses the `LCM_DEFAULT_URL` environment variable to construct a
    /// provider. If the variable does not exist or is empty, it will use
    /// the LCM default of "udpm://239.255.76.67:7667?ttl=0".
    pub fn new() -> Result<Lcm, InitError> {
        let lcm_default_url = env::var("LCM_DEFAULT_URL");
        let lcm_url = match lcm_default_url {
            Ok(ref s) if s.is_empty() => {
                debug!("LCM_DEFAULT_URL available but empty. Using default settings.");
                LCM_DEFAULT_URL
            }
            Ok(ref s) => {
                debug!("LCM_DEFAULT_URL=\"{}\"", s);
                s
            }
            Err(_) => {
                debug!("LCM_DEFAULT_URL not present or unavailable. Using default settings.");
                LCM_DEFAULT_URL
            }
        };

        Lcm::with_lcm_url(lcm_url)
    }

    /// Creates a new `Lcm` instance with the provider constructed from the
    /// supplied LCM URL.
    pub fn with_lcm_url(lcm_url: &str) -> Result<Lcm, InitError> {
        if lcm_url.is_empty() {
            return Lcm::new();
        }

        debug!("Creating LCM instance using \"{}\"", lcm_url);
        let (provider_name, network, options) = parse_lcm_url(lcm_url)?;

        let registry = Registry::new();
        let provider = match provider_name {
            #[cfg(feature = "udpm")]
            "udpm" => Provider::Udpm(UdpmProvider::new(registry.clone(), network, &options)?),

            #[cfg(feature = "file")]
            "file" => Provider::File(FileProvider::new(registry.clone(), network, &options)?),

            #[cfg(feature = "tcpq")]
            "tcpq" => Provider::Tcpq(TcpqProvider::new(registry.clone(), network, &options)?),

            #[cfg(feature = "memq")]
            "memq" => Provider::Memq(MemqProvider::new(registry.clone())?),

            _ => return Err(InitError::UnknownProvider(provider_name.into())),
        };

        Ok(Lcm {
            provider,
            registry,
            handle_mutex: Mutex::new(()),
        })
    }

    /// Subscribes a callback to a channel.
    ///
    /// The channel is a regular expression, implicitly surrounded by '^'
    /// and '$', so a literal name matches exactly itself. The callback
    /// runs on whichever thread calls `handle`.
    pub fn subscribe<F>(&self, channel: &str, callback: F) -> Result<Subscription, SubscribeError>
    where
        F: FnMut(&RecvBuf) + Send + 'static,
    {
        debug!("Registering handler for \"{}\"", channel);

        // Give the provider the chance to allocate its receive resources
        // before the subscription goes live.
        match self.provider {
            #[cfg(feature = "udpm")]
            Provider::Udpm(ref p) => p.subscribe(channel)?,
            #[cfg(feature = "tcpq")]
            Provider::Tcpq(ref p) => p.subscribe(channel)?,
            _ => {}
        }

        self.registry.subscribe(channel, Box::new(callback))
    }

    /// Unsubscribes a message handler.
    ///
    /// If the subscription's callback is executing on another thread, the
    /// removal is deferred until it finishes; the callback is never torn
    /// down underfoot.
    pub fn unsubscribe(&self, subscription: Subscription) -> Result<(), UnsubscribeError> {
        let channel = subscription.remove_from_registry()?;

        match self.provider {
            #[cfg(feature = "tcpq")]
            Provider::Tcpq(ref p) => p.unsubscribe(&channel),
            _ => {}
        }

        Ok(())
    }

    /// Publishes raw bytes on the specified channel.
    pub fn publish(&self, channel: &str, data: &[u8]) -> Result<(), PublishError> {
        provider!(self.publish(channel, data))
    }

    /// Waits for and dispatches the next incoming message.
    pub fn handle(&self) -> Result<(), HandleError> {
        let _guard = self.handle_mutex.lock().unwrap();
        provider!(self.handle())
    }

    /// Waits for and dispatches the next incoming message, giving up after
    /// `timeout`.
    ///
    /// Returns `Ok(false)` if the timeout expired with no message.
    pub fn handle_timeout(&self, timeout: Duration) -> Result<bool, HandleError> {
        let _guard = self.handle_mutex.lock().unwrap();

        let fd = provider!(self.fileno())?;
        // The descriptor stays owned by the provider, which outlives this
        // borrow.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if !utils::wait_readable(borrowed, Some(timeout))? {
            return Ok(false);
        }
        provider!(self.handle()).map(|_| true)
    }

    /// A file descriptor that becomes readable whenever a message is ready
    /// to be dispatched, for use in external `poll`/`select` loops.
    pub fn fileno(&self) -> Result<RawFd, HandleError> {
        provider!(self.fileno())
    }
}

/// The backing providers for the `Lcm` type.
enum Provider {
    /// The UDP multicast provider.
    #[cfg(feature = "udpm")]
    Udpm(UdpmProvider),

    /// The log playback provider.
    #[cfg(feature = "file")]
    File(FileProvider),

    /// The TCP queue provider.
    #[cfg(feature = "tcpq")]
    Tcpq(TcpqProvider),

    /// The in-memory queue provider.
    #[cfg(feature = "memq")]
    Memq(MemqProvider),
}

/// Parses the string into its LCM URL components.
fn parse_lcm_url(lcm_url: &str) -> Result<(&str, &str, HashMap<&str, &str>), InitError> {
    // Start by parsing the provider string
    let (provider, remaining) = if let Some(p) = lcm_url.find("://") {
        let (p, r) = lcm_url.split_at(p);
        (p, &r[3..])
    } else {
        return Err(InitError::InvalidLcmUrl);
    };

    // Then split the network string from the options.
    let (network, options) = if let Some(p) = remaining.rfind('?') {
        let (n, o) = remaining.split_at(p);
        (n, &o[1..])
    } else {
        (remaining, "")
    };

    // Now we convert the options string into a map
    let options = match options {
        "" => HashMap::new(),
        _ => options
            .split('&')
            .map(|s| {
                if let Some(p) = s.find('=') {
                    let (a, v) = s.split_at(p);
                    Ok((a, &v[1..]))
                } else {
                    Err(InitError::InvalidLcmUrl)
                }
            })
            .collect::<Result<_, _>>()?,
    };

    // Then we can return it all
    Ok((provider, network, options))
}
