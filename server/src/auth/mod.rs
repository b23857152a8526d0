//! Authentication in both directions: the node's own credential against the
//! authority ([`broker`]) and signed download links from clients
//! ([`middleware`]), both built on [`sign`].

pub mod broker;
pub mod middleware;
pub mod sign;
