pub mod interface;
pub mod server;
pub mod socket;

#[cfg(test)]
pub(crate) mod mock;
