//! A client for a GitLab container registry and its generic package API.
//!
//! Registries hand out short-lived bearer tokens through an OAuth2-like
//! handshake. The [`session::AuthSession`] owns the credential for one
//! invocation and the [`fetch`] module retries a request exactly once when
//! the registry reports that the credential has gone stale.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod challenge;
pub mod client;
pub mod errors;
pub mod fetch;
pub mod manifest;
pub mod negotiator;
mod reference;
pub mod secrets;
pub mod session;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use errors::RegistryError;
#[doc(inline)]
pub use reference::{split_digest, ParseError, Reference};
