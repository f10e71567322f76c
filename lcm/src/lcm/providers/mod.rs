//! The transport providers.
//!
//! Exactly one provider backs each `Lcm` instance, selected by the scheme
//! of the LCM URL.

#[cfg(feature = "file")]
pub mod file;
#[cfg(feature = "memq")]
pub mod memq;
#[cfg(feature = "tcpq")]
pub mod tcpq;
#[cfg(feature = "udpm")]
pub mod udpm;
