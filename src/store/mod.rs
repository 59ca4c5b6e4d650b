//! Persistent state store

pub mod pool_db;

pub use pool_db::{
    PoolDb, PredictionRejected, RoundEvaluation, StoreCounts, TransitionCommit, TransitionEffect,
};
