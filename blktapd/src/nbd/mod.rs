//! NBD frontend (spec §4.8, C8): exports a single VBD over the Network
//! Block Device protocol, as an alternative to the vhost-user ring in
//! [`crate::ring`].

mod proto;
mod server;

pub use server::NbdServer;
