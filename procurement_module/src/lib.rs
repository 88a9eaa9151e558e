pub mod attachments;
pub mod correlator;
pub mod dispatch;
pub mod enrichment;
pub mod inbound_email;
pub mod llm;
pub mod llm_json;
pub mod models;
pub mod pipeline;
pub mod prompts;
pub mod ranking;
pub mod reply_extractor;
pub mod rfp_structurer;
pub mod service;
pub mod store;

mod html;

pub use correlator::{Correlation, MailCorrelator, MatchTier};
pub use pipeline::{EnrichmentMode, InboundPipeline, IngestOutcome};
pub use ranking::{rank_proposals, ProposalRanker, RankingReport};
pub use store::{InMemoryProcurementStore, ProcurementStore, StoreError};
