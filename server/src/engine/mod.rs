pub mod events;
pub mod hub;
pub mod mailbox;
pub mod session;
pub mod store;
pub mod transport;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;
