//! Inbound framing shared by every transport kind.

pub mod header;
