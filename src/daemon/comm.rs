//! Collective-communication bootstrap.
//!
//! The daemon never links a communication library directly. Callers inject
//! a [`CommLibrary`] symbol table; `deploy_rank_table_message` resolves
//! [`RANK_TABLE_INIT_SYMBOL`] from it and invokes it with the rank table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::status::{HasStatus, StatusCode};

/// Symbol invoked for `deploy_rank_table_message`.
pub const RANK_TABLE_INIT_SYMBOL: &str = "comm_init_cluster_info";

/// `(rank_table, rank_id)`; errors are reported as plain text.
pub type CommInitFn = Arc<dyn Fn(&str, i32) -> Result<(), String> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("Communication symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Invalid rank table: {0}")]
    InvalidRankTable(String),

    #[error("Communication init failed: {0}")]
    InitFailed(String),
}

impl HasStatus for CommError {
    fn status(&self) -> StatusCode {
        match self {
            CommError::SymbolNotFound(_) => StatusCode::Unsupported,
            CommError::InvalidRankTable(_) => StatusCode::ParamInvalid,
            CommError::InitFailed(_) => StatusCode::Failed,
        }
    }
}

#[derive(Clone, Default)]
pub struct CommLibrary {
    symbols: HashMap<String, CommInitFn>,
    initialized_rank: Option<i32>,
}

impl CommLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symbol(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&str, i32) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.symbols.insert(name.into(), Arc::new(f));
        self
    }

    pub fn resolve(&self, name: &str) -> Result<&CommInitFn, CommError> {
        self.symbols.get(name).ok_or_else(|| CommError::SymbolNotFound(name.to_string()))
    }

    /// Rank table must be a JSON document.
    pub fn init_rank_table(&mut self, rank_table: &str, rank_id: i32) -> Result<(), CommError> {
        if rank_id < 0 {
            return Err(CommError::InvalidRankTable(format!("negative rank id {rank_id}")));
        }
        serde_json::from_str::<serde_json::Value>(rank_table)
            .map_err(|e| CommError::InvalidRankTable(e.to_string()))?;
        let init = self.resolve(RANK_TABLE_INIT_SYMBOL)?;
        init(rank_table, rank_id).map_err(CommError::InitFailed)?;
        self.initialized_rank = Some(rank_id);
        tracing::info!(rank_id, "collective communication initialized");
        Ok(())
    }

    pub fn initialized_rank(&self) -> Option<i32> {
        self.initialized_rank
    }
}

impl fmt::Debug for CommLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.symbols.keys().collect();
        names.sort();
        f.debug_struct("CommLibrary")
            .field("symbols", &names)
            .field("initialized_rank", &self.initialized_rank)
            .finish()
    }
}
