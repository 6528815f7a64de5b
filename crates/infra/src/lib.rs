//! Infrastructure layer: persistence, external ports, the retry
//! orchestrator, the manual-operation service, and reporting.

pub mod orchestrator;
pub mod ports;
pub mod reporting;
pub mod repository;
pub mod service;

pub use orchestrator::{DunningOrchestrator, OrchestratorConfig, TickReport};
pub use ports::{
    ChargeOutcome, CsmAssignmentPort, GatewayRetryConfig, NotificationPort, PaymentGatewayPort,
    RetryingGateway,
};
pub use reporting::{CurrencyAtRisk, DunningStatistics, RevenueAtRisk, revenue_at_risk, statistics};
pub use repository::{
    DunningRepository, in_memory::InMemoryDunningRepository,
    postgres::PostgresDunningRepository,
};
pub use service::{DunningService, OpenSequence};
