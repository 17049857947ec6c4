//! The networking modules in `conduit` terminate encrypted peer sessions
//! over TCP and shuttle discrete messages between those peers and the
//! upstream transport service.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod net;
