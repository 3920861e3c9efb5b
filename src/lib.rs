//! Network-first offline cache agent.
//!
//! A [`mediator::CacheMediator`] is registered with a [`worker::Host`] and
//! then sees every request made by the clients it controls. Requests always
//! go to the network first; successful responses to safe methods are kept
//! in a single versioned cache region and served back only when the network
//! fails. Deploying a new version string discards every older region on
//! activation.

pub mod cache;
pub mod config;
pub mod logging;
pub mod mediator;
pub mod net;
pub mod worker;
