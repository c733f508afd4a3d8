pub mod applications;
pub mod integrations;
pub mod transactions;
