//! Data model and rollout evaluation for flagsync.
//!
//! This crate holds everything that does not touch the network:
//!
//! - **Features**: replicated feature records and explicit value coercion
//! - **Strategies**: rollout strategies and their rules
//! - **Context**: caller attributes rules are evaluated against
//! - **Evaluator**: deterministic, first-match strategy evaluation
//! - **Messages**: decoding of feature service stream messages

pub mod context;
mod error;
pub mod evaluator;
pub mod feature;
pub mod message;
pub mod strategy;

pub use context::{AttributeValue, EvaluationContext};
pub use error::ProtocolError;
pub use evaluator::{Evaluation, PERCENTAGE_BUCKETS, evaluate, percentage_bucket, resolve_value};
pub use feature::{FeatureRecord, FeatureType};
pub use message::StreamMessage;
pub use strategy::{FieldType, Operator, RolloutStrategy, Rule};
