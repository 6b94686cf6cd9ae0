//! TRv1 BFT Accountability
//!
//! Detects, proves and reports Byzantine behaviour of consensus committee
//! members from the consensus messages a node observes, and defends the
//! local node against false accusations.
//!
//! Three kinds of proof come out of it:
//!
//! - **Misbehaviour**: self-sufficient evidence of a protocol violation
//!   (equivocation, a proposal from the wrong proposer, a precommit against
//!   a quorum of prevotes, ...).
//! - **Accusation**: a message that looks unjustified given what this node
//!   saw. The suspect gets a chance to answer before it is escalated.
//! - **Innocence**: the answer to an accusation, built from the suspect's
//!   own message store.
//!
//! Every proof can be checked without local state by the verifiers in
//! [`verifier`], which also back the native contracts the execution layer
//! calls on-chain.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      FaultDetector                        │
//! │                                                           │
//! │  ┌──────────────┐   ┌──────────┐   ┌──────────────────┐  │
//! │  │ Message loop │──▶│ MsgStore │◀──│    Block loop    │  │
//! │  │ incrimination│   └──────────┘   │   rule engine    │  │
//! │  │ off-chain    │                  │   escalation, gc │  │
//! │  └──────┬───────┘                  └────────┬─────────┘  │
//! │         │ misbehaviours                     │ events     │
//! │         └──────────────────────────────────▶│            │
//! │                                    ┌────────▼─────────┐  │
//! │                                    │ Reporter         │  │
//! │                                    │ chunks, confirms │  │
//! │                                    └──────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod chain;
pub mod codec;
pub mod committee;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fault_detector;
pub mod incrimination;
pub mod innocence;
pub mod message;
pub mod msg_store;
pub mod offchain;
pub mod proof;
pub mod proposer;
pub mod rate_limiter;
pub mod reporter;
pub mod rules;
pub mod verifier;

#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod test_utils;

pub use {
    chain::{AccountabilityContract, ChainContext, PeerNetwork},
    committee::Committee,
    config::AccountabilityConfig,
    crypto::{Ed25519Verifier, SignatureVerifier},
    error::{AccountabilityError, Result},
    fault_detector::{AccountabilityContext, FaultDetector, FaultDetectorEvent},
    message::ConsensusMessage,
    msg_store::MsgStore,
    proof::{AccountabilityEvent, Proof, ProofType, Rule},
    rules::run_rules,
    verifier::{AccountabilityPrecompiles, NativeContract},
};
