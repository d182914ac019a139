//! Analysis Service
//!
//! Image analysis orchestration for the vision gallery. An uploaded image
//! produces a retrievable analysis document in a remote JSON document store,
//! and deleting the image removes the document too.
//!
//! ## Features
//!
//! - **Credential Resolution**: vault secret, operator configuration and a
//!   development-only static fallback, tried in order and cached
//! - **Document Store Client**: SODA-style REST protocol with idempotent keyed
//!   inserts, acknowledged deletes and extended-JSON normalization
//! - **Analysis Pipeline**: per-event state machine that degrades instead of
//!   failing when the document store is unusable
//! - **Deletion Coordination**: document first, then image, with dangling
//!   documents reported as consistency violations
//! - **Result Views**: display-ready records that keep "not analyzed",
//!   "failed" and "store unreachable" apart
//!
//! ## Architecture
//!
//! ```text
//! Object Storage          Analysis Service                  Document Store
//! ┌──────────────┐  event  ┌──────────────┐               ┌──────────────┐
//! │ images/      │────────▶│ Pipeline     │──────────────▶│ IMAGE_       │
//! │   {key}      │         │ Handler      │   put (REST)  │ ANALYSIS     │
//! └──────────────┘         └──────────────┘               └──────────────┘
//!        ▲                   │         ▲                         ▲
//!        │                   ▼         │                         │
//!        │            ┌──────────────┐ │  ┌──────────────┐       │
//!        │            │ Vision       │ └──│ Credential   │       │
//!        │            │ Capability   │    │ Resolver     │       │
//!        │            └──────────────┘    └──────────────┘       │
//!        │                                                       │
//!        │           ┌──────────────┐    ┌──────────────┐        │
//!        └───────────│ Deletion     │    │ Result View  │────────┘
//!                    │ Coordinator  │    │ Composer     │
//!                    └──────────────┘    └──────────────┘
//!                            ▲                   ▲
//!                            └────── HTTP API ───┘
//! ```

pub mod analysis;
pub mod api;
pub mod config;
pub mod credentials;
pub mod deletion;
pub mod document_store;
pub mod error;
pub mod events;
pub mod models;
pub mod object_store;
pub mod pipeline;
pub mod view;

pub use analysis::{AnalysisCapability, AnalysisRequest, VisionClient};
pub use api::{create_router, start_api_server, AppState};
pub use config::Config;
pub use credentials::{
    Credential, CredentialKind, CredentialResolver, CredentialStrategy, SecretSource,
    SecretsManagerSource,
};
pub use deletion::{DeletionCoordinator, DeletionResult};
pub use document_store::{normalize, DocumentStore, SodaClient};
pub use error::{AnalysisError, AuthenticationError, ObjectStoreError, StoreError};
pub use events::{Notification, ObjectCreatedEvent};
pub use models::{document_key_for, AnalysisDocument, AnalysisStatus, ImageAsset};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use pipeline::{AnalysisHandler, HandlerOutcome, HandlerSettings, HandlerState};
pub use view::{AnalysisView, ResultView, ResultViewComposer};
