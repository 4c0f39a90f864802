pub mod access;
pub mod catalog;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod reconciliation;
pub mod repository;
pub mod subscriptions;
pub mod sweep;

pub use access::AccessResolver;
pub use catalog::PlanCatalog;
pub use gateway::GatewayClient;
pub use ledger::TransactionLedger;
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::ReconciliationEngine;
pub use repository::BillingRepository;
pub use subscriptions::SubscriptionManager;
pub use sweep::ExpirySweeper;
