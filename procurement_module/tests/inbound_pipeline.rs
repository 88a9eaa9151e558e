mod test_support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use procurement_module::attachments::{AttachmentRelocator, ObjectAcl, ObjectStorage};
use procurement_module::correlator::{
    MailCorrelator, MatchTier, UNKNOWN_VENDOR_EMAIL, UNMATCHED_RFP_TOKEN,
};
use procurement_module::enrichment::{EnrichmentOutcome, ProposalEnricher, SkipReason};
use procurement_module::inbound_email::{InboundAttachment, InboundEmail, Mailbox};
use procurement_module::llm::LlmClient;
use procurement_module::models::{DispatchStatus, NewProposal, ProposalFields};
use procurement_module::pipeline::{EnrichmentMode, InboundPipeline};
use procurement_module::ranking::{ProposalRanker, Recommendation};
use procurement_module::store::{InMemoryProcurementStore, ProcurementStore};

use test_support::{
    memory_store, seed_buyer, seed_dispatch, seed_rfp, seed_vendor, FailingLlm,
    MemoryObjectStorage, ScriptedLlm, PROPOSAL_JSON,
};

const SYSTEM_USER: &str = "system@procurement.local";

fn pipeline(
    store: &Arc<InMemoryProcurementStore>,
    llm: Option<Arc<dyn LlmClient>>,
    storage: Option<Arc<dyn ObjectStorage>>,
    mode: EnrichmentMode,
) -> InboundPipeline {
    let store: Arc<dyn ProcurementStore> = store.clone();
    InboundPipeline::new(
        store.clone(),
        MailCorrelator::new(store.clone(), SYSTEM_USER),
        AttachmentRelocator::new(storage, ObjectAcl::PublicRead, None, Duration::from_secs(5)),
        ProposalEnricher::new(store, llm, Duration::from_secs(5)),
        mode,
    )
}

fn email_from(address: Option<&str>, body: &str) -> InboundEmail {
    InboundEmail {
        from: address.map(|address| Mailbox {
            address: address.to_string(),
            name: None,
        }),
        subject: "Quote".to_string(),
        text_body: Some(body.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn unmatched_emails_always_land_on_sentinel_records() {
    let store = memory_store();
    let pipeline = pipeline(&store, None, None, EnrichmentMode::Inline);

    let first = pipeline
        .ingest(email_from(Some("New.Vendor@Example.com"), "Our price is $500."))
        .await
        .expect("first ingest");
    let second = pipeline
        .ingest(email_from(None, "Anonymous quote: $700 total."))
        .await
        .expect("second ingest");

    assert_eq!(first.correlation.tier, MatchTier::Fallback);
    assert_eq!(second.correlation.tier, MatchTier::Fallback);
    assert_eq!(first.proposal.rfp_id, second.proposal.rfp_id);
    assert!(first.proposal.sent_rfp_reference.is_none());

    let sentinel = store
        .get_rfp(first.proposal.rfp_id)
        .expect("get rfp")
        .expect("sentinel rfp");
    assert_eq!(sentinel.reference_token, UNMATCHED_RFP_TOKEN);

    let auto_vendor = store
        .get_vendor(first.proposal.vendor_id)
        .expect("get vendor")
        .expect("auto vendor");
    assert_eq!(auto_vendor.contact_email, "new.vendor@example.com");
    assert_eq!(auto_vendor.name, "New.Vendor");

    let unknown = store
        .get_vendor(second.proposal.vendor_id)
        .expect("get vendor")
        .expect("unknown vendor");
    assert_eq!(unknown.contact_email, UNKNOWN_VENDOR_EMAIL);

    let third = pipeline
        .ingest(email_from(None, "Another anonymous quote."))
        .await
        .expect("third ingest");
    assert_eq!(third.proposal.vendor_id, unknown.id);
    assert_eq!(third.proposal.rfp_id, sentinel.id);
}

#[tokio::test]
async fn correlation_prefers_thread_headers_then_tokens_then_sender_history() {
    let store = memory_store();
    let buyer = seed_buyer(store.as_ref());
    let laptops = seed_rfp(store.as_ref(), &buyer, "laptops", Some(50_000.0), Some(30));
    let chairs = seed_rfp(store.as_ref(), &buyer, "chairs", Some(5_000.0), Some(10));
    let vendor = seed_vendor(store.as_ref(), "Acme", "sales@acme.test");
    seed_dispatch(
        store.as_ref(),
        &laptops,
        &vendor,
        "rfp.laptops.aa",
        "<rfp-laptops@reply.buyer.test>",
    );
    seed_dispatch(
        store.as_ref(),
        &chairs,
        &vendor,
        "rfp.chairs.bb",
        "<rfp-chairs@reply.buyer.test>",
    );
    let pipeline = pipeline(&store, None, None, EnrichmentMode::Inline);

    let mut email = email_from(Some("sales@acme.test"), "See quote below.");
    email.in_reply_to = vec!["<RFP-Laptops@reply.buyer.test>".to_string()];
    email.to = vec!["rfp+rfp.chairs.bb@reply.buyer.test".to_string()];
    let outcome = pipeline.ingest(email.clone()).await.expect("ingest");
    assert_eq!(outcome.correlation.tier, MatchTier::ThreadReply);
    assert_eq!(outcome.proposal.rfp_id, laptops.id);
    assert_eq!(
        outcome.proposal.sent_rfp_reference.as_deref(),
        Some("rfp.laptops.aa")
    );

    email.in_reply_to.clear();
    email.to = vec!["Procurement <rfp+rfp.chairs.bb@reply.buyer.test>".to_string()];
    let outcome = pipeline.ingest(email.clone()).await.expect("ingest");
    assert_eq!(outcome.correlation.tier, MatchTier::ReferenceToken);
    assert_eq!(outcome.proposal.rfp_id, chairs.id);

    email.to.clear();
    email.subject = "Re: Laptops [REF:rfp.laptops.aa]".to_string();
    let outcome = pipeline.ingest(email.clone()).await.expect("ingest");
    assert_eq!(outcome.correlation.tier, MatchTier::ReferenceToken);
    assert_eq!(outcome.proposal.rfp_id, laptops.id);

    email.subject = "Following up".to_string();
    let outcome = pipeline.ingest(email).await.expect("ingest");
    assert_eq!(outcome.correlation.tier, MatchTier::SenderHistory);
    assert_eq!(outcome.proposal.rfp_id, chairs.id);
    assert_eq!(outcome.proposal.vendor_id, vendor.id);

    for reference in ["rfp.laptops.aa", "rfp.chairs.bb"] {
        let dispatch = store
            .find_dispatch_by_reference_id(reference)
            .expect("lookup")
            .expect("dispatch");
        assert_eq!(dispatch.status, DispatchStatus::Delivered);
    }
}

#[tokio::test]
async fn enrichment_fills_fields_and_relocates_surviving_attachments() {
    let store = memory_store();
    let llm = ScriptedLlm::new(PROPOSAL_JSON);
    let storage = Arc::new(MemoryObjectStorage::failing_on("broken"));
    let pipeline = pipeline(
        &store,
        Some(llm.clone() as Arc<dyn LlmClient>),
        Some(storage.clone() as Arc<dyn ObjectStorage>),
        EnrichmentMode::Inline,
    );

    let mut email = email_from(
        Some("quotes@globex.test"),
        "We can deliver 20 laptops for $45,000 in two weeks.\n\n\
         On Mon, Jan 6, 2025 at 9:00 AM Buyer <buyer@buyer.test> wrote:\n\
         > Please quote 20 laptops.",
    );
    email.attachments = vec![
        InboundAttachment {
            filename: Some("price sheet.pdf".to_string()),
            content_type: Some("application/pdf".to_string()),
            bytes: b"%PDF-1.4".to_vec(),
        },
        InboundAttachment {
            filename: Some("broken.xlsx".to_string()),
            content_type: None,
            bytes: vec![0; 4],
        },
    ];

    let outcome = pipeline.ingest(email).await.expect("ingest");
    let fields = match outcome.enrichment.clone() {
        Some(EnrichmentOutcome::Enriched(fields)) => fields,
        other => panic!("expected enrichment, got {:?}", other),
    };
    assert_eq!(fields.price_usd, Some(45_000.0));
    assert_eq!(fields.delivery_days, Some(14));
    assert_eq!(fields.warranty_months, Some(24));
    assert_eq!(fields.completeness_score, Some(95.0));
    assert_eq!(fields.line_items.as_ref().map(Vec::len), Some(1));

    assert_eq!(outcome.proposal.attachments.len(), 1);
    let attachment = &outcome.proposal.attachments[0];
    assert_eq!(attachment.filename, "price sheet.pdf");
    assert!(attachment.storage_key.starts_with("inbound/"));
    assert!(attachment.storage_key.ends_with("__price_sheet.pdf"));
    assert_eq!(attachment.size, 8);
    assert_eq!(
        attachment.url,
        format!("https://storage.test/public/{}", attachment.storage_key)
    );
    assert_eq!(storage.puts().len(), 1);

    let stored = store
        .get_proposal(outcome.proposal.id)
        .expect("get")
        .expect("proposal");
    assert!(stored.parsed_at.is_some());
    assert_eq!(stored.fields, fields);
    assert!(stored.raw_email_body.contains("Please quote 20 laptops."));

    let enricher = ProposalEnricher::new(
        store.clone(),
        Some(llm.clone() as Arc<dyn LlmClient>),
        Duration::from_secs(5),
    );
    let again = enricher
        .enrich(stored.id, "Updated price: $40,000 for everything.")
        .await;
    assert_eq!(again, EnrichmentOutcome::Skipped(SkipReason::AlreadyEnriched));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn llm_failure_keeps_the_raw_proposal() {
    let store = memory_store();
    let pipeline = pipeline(
        &store,
        Some(Arc::new(FailingLlm) as Arc<dyn LlmClient>),
        None,
        EnrichmentMode::Inline,
    );
    let outcome = pipeline
        .ingest(email_from(
            Some("sales@initech.test"),
            "Price is 12,000 USD with 60 day delivery.",
        ))
        .await
        .expect("ingest");
    assert!(matches!(outcome.enrichment, Some(EnrichmentOutcome::Failed(_))));

    let stored = store
        .get_proposal(outcome.proposal.id)
        .expect("get")
        .expect("proposal survives");
    assert!(stored.parsed_at.is_none());
    assert!(stored.fields.is_empty());
    assert_eq!(stored.raw_email_body, "Price is 12,000 USD with 60 day delivery.");
}

#[tokio::test]
async fn background_enrichment_finishes_after_ingest_returns() {
    let store = memory_store();
    let llm = ScriptedLlm::new(PROPOSAL_JSON);
    let pipeline = pipeline(
        &store,
        Some(llm.clone() as Arc<dyn LlmClient>),
        None,
        EnrichmentMode::Background,
    );
    let outcome = pipeline
        .ingest(email_from(
            Some("sales@umbrella.test"),
            "Quote attached: $45,000, 14 days, 24 month warranty.",
        ))
        .await
        .expect("ingest");
    assert!(outcome.enrichment.is_none());

    let mut parsed = false;
    for _ in 0..50 {
        let proposal = store
            .get_proposal(outcome.proposal.id)
            .expect("get")
            .expect("proposal");
        if proposal.parsed_at.is_some() {
            assert_eq!(proposal.fields.price_usd, Some(45_000.0));
            parsed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(parsed, "background enrichment never completed");
}

#[tokio::test]
async fn ranking_over_stored_proposals_is_deterministic() {
    let store = memory_store();
    let buyer = seed_buyer(store.as_ref());
    let rfp = seed_rfp(store.as_ref(), &buyer, "servers", Some(10_000.0), Some(10));

    let entries = [
        (
            "Vendor C",
            ProposalFields {
                completeness_score: Some(20.0),
                ..Default::default()
            },
        ),
        (
            "Vendor A",
            ProposalFields {
                price_usd: Some(9_000.0),
                completeness_score: Some(100.0),
                delivery_days: Some(5),
                warranty_months: Some(24),
                payment_terms: Some("Net 30".to_string()),
                ..Default::default()
            },
        ),
        (
            "Vendor B",
            ProposalFields {
                price_usd: Some(11_000.0),
                completeness_score: Some(50.0),
                delivery_days: Some(15),
                ..Default::default()
            },
        ),
    ];
    for (name, fields) in entries {
        let email = format!("{}@vendors.test", name.replace(' ', "").to_ascii_lowercase());
        let vendor = seed_vendor(store.as_ref(), name, &email);
        let proposal = store
            .create_proposal(&NewProposal {
                rfp_id: rfp.id,
                vendor_id: vendor.id,
                sent_rfp_reference: None,
                raw_email_body: "quote".to_string(),
            })
            .expect("proposal");
        store
            .apply_proposal_fields(proposal.id, &fields, Utc::now())
            .expect("apply");
    }

    let ranker = ProposalRanker::new(store.clone());
    let first = ranker.rank(rfp.id).await.expect("rank");
    let second = ranker.rank(rfp.id).await.expect("rank again");
    assert_eq!(first, second);

    let order: Vec<(&str, i64, Recommendation)> = first
        .ranked_proposals
        .iter()
        .map(|entry| {
            (
                entry.vendor.name.as_str(),
                entry.ranking_score,
                entry.recommendation,
            )
        })
        .collect();
    assert_eq!(
        order,
        vec![
            ("Vendor A", 63, Recommendation::BestChoice),
            ("Vendor B", 15, Recommendation::Consider),
            ("Vendor C", 6, Recommendation::LeastSuitable),
        ]
    );
    assert_eq!(first.summary.average_price, 10_000.0);
}
