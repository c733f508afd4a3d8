//! `bindings` crate — connects integrations to applications.
//!
//! An application owns connections and a table of inbound and outbound
//! endpoints. Integrations bind their endpoint steps to it; inbound HTTP
//! requests are resolved to a connection and the integrations bound through
//! it, and outbound endpoint steps are routed to the bound connection.

pub mod application;
pub mod connection;
pub mod directory;
pub mod endpoint;
pub mod http;
pub mod registry;

pub use application::{Application, ApplicationHooks, EndpointApplication};
pub use connection::{Connection, ConnectionStatus};
pub use directory::ApplicationDirectory;
pub use endpoint::{
    outbound_fn, EndpointHandler, EndpointTable, ExecuteIntegrations, FnOutbound, InboundCall, InboundEndpoint,
    InboundHandler, OutboundCall, OutboundHandler,
};
pub use http::{HttpMethod, HttpRegistrar, HttpRequest, HttpResponse, HttpRoutes};
pub use registry::{Binding, BindingRegistry};

#[cfg(test)]
mod application_tests;
