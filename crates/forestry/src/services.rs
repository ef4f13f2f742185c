//! 🛎️ Services: thin wrappers over the REST endpoints the core needs.
//!
//! Each function here is one endpoint: build the [`RestRequest`](crate::transport::RestRequest),
//! call [`HostClient::execute`](crate::clients::HostClient::execute), decode the answer.
//! No loops, no threads, no opinions. The batchers have enough opinions for everyone.

pub mod data_services;
pub mod documents;
pub mod internal;
pub mod transactions;
