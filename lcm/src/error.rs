//! Error types associated with LCM operations.
//!
//! In general, one will want to return an `Error` from a function as all of
//! the other errors can be converted into the `Error` using either the `?`
//! operator or `From`. The other error types exist in case one wants to
//! attempt to recover from an error.

use std::{io, string};
use regex;

/// A generic LCM error.
///
/// If one does not intend to try and recover from errors, this is the best
/// error type to handle. All of the LCM errors can be converted to this type
/// using the `?` operator.
#[derive(Debug, Fail)]
pub enum Error {
    /// An error happened while initializing the LCM instance.
    #[fail(display = "An error happened during initialization.")]
    Init(#[cause] InitError),

    /// An error happened while trying to subscribe to a channel.
    #[fail(display = "Failed to subscribe to the channel.")]
    Subscribe(#[cause] SubscribeError),

    /// An error happened while trying to unsubscribe from a channel.
    #[fail(display = "Failed to unsubscribe from the channel.")]
    Unsubscribe(#[cause] UnsubscribeError),

    /// An error happened while trying to publish a message.
    #[fail(display = "Failed to publish message.")]
    Publish(#[cause] PublishError),

    /// An error happened while trying to handle incoming messages.
    #[fail(display = "Unable to handle incoming messages.")]
    Handle(#[cause] HandleError),

    /// An error happened while reading or writing an event log.
    #[fail(display = "Event log operation failed.")]
    Log(#[cause] LogError),
}
impl From<InitError> for Error {
    fn from(err: InitError) -> Self {
        Error::Init(err)
    }
}
impl From<SubscribeError> for Error {
    fn from(err: SubscribeError) -> Self {
        Error::Subscribe(err)
    }
}
impl From<UnsubscribeError> for Error {
    fn from(err: UnsubscribeError) -> Self {
        Error::Unsubscribe(err)
    }
}
impl From<PublishError> for Error {
    fn from(err: PublishError) -> Self {
        Error::Publish(err)
    }
}
impl From<HandleError> for Error {
    fn from(err: HandleError) -> Self {
        Error::Handle(err)
    }
}
impl From<LogError> for Error {
    fn from(err: LogError) -> Self {
        Error::Log(err)
    }
}

/// The LCM instance was unable to start.
#[derive(Debug, Fail)]
pub enum InitError {
    /// There was an IO issue that prevented the provider from starting.
    #[fail(display = "The LCM provider failed to start due to an IO error.")]
    IoError(#[cause] io::Error),

    /// The supplied LCM URL requested a provider that isn't known.
    ///
    /// If you get this error, check the feature flags on the crate. It is
    /// possible that the provider you are requesting is disabled.
    #[fail(display = "Unknown provider \"{}\".", _0)]
    UnknownProvider(String),

    /// The provided LCM URL was not valid.
    #[fail(display = "Invalid LCM URL.")]
    InvalidLcmUrl,

    /// The network portion of the LCM URL could not be parsed.
    #[fail(display = "Invalid network target \"{}\".", _0)]
    BadNetworkTarget(String),

    /// The provider requires a target but none was given.
    #[fail(display = "The LCM URL is missing a target.")]
    MissingTarget,

    /// The UDPM provider could not complete its startup round-trip.
    ///
    /// This almost always means there is no usable multicast route. Check
    /// the routing tables and firewall settings on this host.
    #[fail(display = "The provider self test failed.")]
    SelfTestFailed,

    /// The log file could not be opened or parsed.
    #[fail(display = "Unable to open the event log.")]
    Log(#[cause] LogError),

    /// The log file did not contain any events.
    #[fail(display = "The event log contains no events.")]
    EmptyLog,
}

/// The attempt to subscribe to a channel was unsuccessful.
#[derive(Debug, Fail)]
pub enum SubscribeError {
    /// The provided string was an invalid regular expression.
    #[fail(display = "Invalid regular expression used.")]
    InvalidRegex(#[cause] regex::Error),

    /// The provider failed to allocate its receive resources.
    #[fail(display = "The provider could not allocate receive resources.")]
    ProviderInit(#[cause] InitError),
}

/// The attempt to remove a subscription was unsuccessful.
#[derive(Debug, Fail)]
pub enum UnsubscribeError {
    /// The subscription is not registered with this LCM instance.
    ///
    /// This also covers subscriptions whose instance has already been
    /// destroyed and subscriptions that were removed earlier.
    #[fail(display = "The subscription was not found.")]
    NotFound,
}

/// Publishing to a channel failed.
#[derive(Debug, Fail)]
pub enum PublishError {
    /// Channel names are limited to 63 bytes.
    #[fail(display = "Channel name too long: \"{}\".", _0)]
    ChannelTooLong(String),

    /// The message would not fit in 65535 fragments.
    #[fail(display = "Too much data for a single message ({} fragments).", _0)]
    TooManyFragments(usize),

    /// The active provider is unable to publish messages.
    #[fail(display = "The provider does not support publishing.")]
    NotSupported,

    /// The kernel accepted fewer bytes than the datagram contained.
    #[fail(display = "Sent {} of {} bytes.", sent, expected)]
    ShortSend {
        /// The number of bytes actually sent.
        sent: usize,
        /// The size of the datagram.
        expected: usize,
    },

    /// There was an IO issue that prevented the provider from sending the
    /// message.
    #[fail(display = "Failed to send the message due to an IO error.")]
    IoError(#[cause] io::Error),
}

/// Error occurred while trying to handle incoming messages.
#[derive(Debug, Fail)]
pub enum HandleError {
    /// There was an IO error while trying to handle messages.
    #[fail(display = "Failed to handle messages due to an IO error.")]
    IoError(#[cause] io::Error),

    /// The provider failed to allocate its receive resources.
    #[fail(display = "The provider could not allocate receive resources.")]
    ProviderInit(#[cause] InitError),

    /// The log playback provider ran out of events.
    #[fail(display = "Reached the end of the event log.")]
    EndOfLog,

    /// The event log being played back could not be read.
    #[fail(display = "Unable to read the event log.")]
    Log(#[cause] LogError),

    /// The connection to the server was lost.
    ///
    /// The provider will transparently reconnect on the next operation.
    #[fail(display = "Disconnected from the server.")]
    Disconnected,

    /// The notify pipe was signaled but no message was queued.
    ///
    /// This should never happen and indicates a bug. Please report it.
    #[fail(display = "No message available despite notification.")]
    SpuriousWakeup,
}

/// An error occurred while reading or writing an event log.
#[derive(Debug, Fail)]
pub enum LogError {
    /// There was an IO error while accessing the log file.
    #[fail(display = "Failed to access the log file due to an IO error.")]
    IoError(#[cause] io::Error),

    /// An event frame failed its sanity checks.
    #[fail(display = "Corrupt event log: {}.", _0)]
    Corrupt(&'static str),

    /// A channel name in the log was not valid UTF-8.
    #[fail(display = "Invalid Unicode in channel name.")]
    Utf8Error(#[cause] string::FromUtf8Error),
}

#[doc(hidden)]
pub mod from {
    use super::*;

    #[doc(hidden)]
    impl From<io::Error> for InitError {
        fn from(err: io::Error) -> Self {
            InitError::IoError(err)
        }
    }
    #[doc(hidden)]
    impl From<LogError> for InitError {
        fn from(err: LogError) -> Self {
            InitError::Log(err)
        }
    }
    #[doc(hidden)]
    impl From<regex::Error> for SubscribeError {
        fn from(err: regex::Error) -> Self {
            SubscribeError::InvalidRegex(err)
        }
    }
    #[doc(hidden)]
    impl From<InitError> for SubscribeError {
        fn from(err: InitError) -> Self {
            SubscribeError::ProviderInit(err)
        }
    }
    #[doc(hidden)]
    impl From<io::Error> for PublishError {
        fn from(err: io::Error) -> Self {
            PublishError::IoError(err)
        }
    }
    #[doc(hidden)]
    impl From<io::Error> for HandleError {
        fn from(err: io::Error) -> Self {
            HandleError::IoError(err)
        }
    }
    #[doc(hidden)]
    impl From<InitError> for HandleError {
        fn from(err: InitError) -> Self {
            HandleError::ProviderInit(err)
        }
    }
    #[doc(hidden)]
    impl From<LogError> for HandleError {
        fn from(err: LogError) -> Self {
            HandleError::Log(err)
        }
    }
    #[doc(hidden)]
    impl From<io::Error> for LogError {
        fn from(err: io::Error) -> Self {
            LogError::IoError(err)
        }
    }
    #[doc(hidden)]
    impl From<string::FromUtf8Error> for LogError {
        fn from(err: string::FromUtf8Error) -> Self {
            LogError::Utf8Error(err)
        }
    }
}
