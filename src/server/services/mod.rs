pub mod browser_services;
pub mod edge_services;
pub mod event_services;
pub mod resolver_services;
pub mod sandbox_services;
pub mod transport_services;

pub use event_services::DynEventService;
pub use resolver_services::DynResolverService;
pub use sandbox_services::DynSandboxService;
pub use transport_services::DynTransportService;
