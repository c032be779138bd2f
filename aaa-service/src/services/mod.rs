//! Core services: catalog, principal graph, decision cache, authorization
//! engine, tokens, service-authorization policy, and the audit pipeline.

pub mod audit;
pub mod cache;
pub mod catalog;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod policy;
pub mod revocation;
pub mod token;

pub use audit::{AuditEvent, AuditService, AuditSink, AuditWriterHandle, start_pipeline};
pub use cache::{DecisionCache, PermSet};
pub use catalog::{CatalogService, SeedOutcome};
pub use context::CallContext;
pub use engine::{AuthzEngine, CheckRequest, ColumnDecision, PrincipalRef};
pub use error::ServiceError;
pub use graph::PrincipalGraphService;
pub use policy::{PolicyDocument, ServiceAuthorizer, normalize_service_name};
pub use revocation::{MemoryRevocationStore, RedisRevocationStore, RevocationStore};
pub use token::{
    AcceptAllOtpVerifier, Claims, OtpVerifier, TokenService, TokenSnapshot, TokenType,
};
