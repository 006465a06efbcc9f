pub mod audit_ledger;
pub mod reconcile_balances;
