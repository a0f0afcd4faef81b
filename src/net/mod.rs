//! Stream plumbing shared by the server and client sides.

pub mod secure;

pub use secure::{
    BoxedStream, CertificateValidator, ChannelIdentity, PlainChannel, Role, SecureChannel, Stream,
};
