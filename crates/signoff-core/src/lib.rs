//! # signoff-core
//!
//! Core primitives for the signoff approval orchestration engine.
//!
//! This crate provides the foundational types used across all signoff
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for workflows, steps, approvals,
//!   and dead letters
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Structured logging bootstrap and span helpers
//! - **Signing**: Callback-token minting/verification and inbound webhook
//!   signature validation
//!
//! ## Crate Boundary
//!
//! `signoff-core` is the only crate allowed to define shared primitives.
//! The orchestration kernel (`signoff-flow`) and any outer surfaces build
//! on the contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use signoff_core::prelude::*;
//!
//! let workflow = WorkflowId::generate();
//! let approval = ApprovalId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: WorkflowId = approval;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod signing;

pub use error::{Error, Result};
pub use id::{ApprovalId, DeadLetterId, StepId, WorkflowId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use signoff_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ApprovalId, DeadLetterId, StepId, WorkflowId};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::signing::{
        decode_callback_token, mint_callback_token, sign_webhook_payload,
        verify_webhook_signature, CallbackClaims, MintedToken, SigningConfig,
    };
}
